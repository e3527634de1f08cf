//! Resource requests with excluded hosts.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Unterminated select[] clause in resource request: {0}")]
    UnterminatedSelect(String),
}

/// Build the `-R` argument from the configured request and the exclude set.
///
/// A resource string can be `span[host=1] select[A && B] bla[xyz]`; excluded
/// hosts become `hname!='host'` terms inside its `select[...]` clause, which
/// is created when missing.
pub fn compose_resource(
    base: Option<&str>,
    exclude_hosts: &[String],
) -> Result<Option<String>, ResourceError> {
    if exclude_hosts.is_empty() {
        return Ok(base.map(str::to_string));
    }

    let terms = exclude_hosts
        .iter()
        .map(|host| format!("hname!='{}'", host))
        .collect::<Vec<_>>()
        .join(" && ");

    let Some(base) = base else {
        return Ok(Some(format!("select[{}]", terms)));
    };

    let Some(select) = base.find("select[") else {
        return Ok(Some(format!("{} select[{}]", base, terms)));
    };

    let Some(close) = base[select..].find(']').map(|pos| select + pos) else {
        return Err(ResourceError::UnterminatedSelect(base.to_string()));
    };

    Ok(Some(format!(
        "{} && {}{}",
        &base[..close],
        terms,
        &base[close..]
    )))
}
