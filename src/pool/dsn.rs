//! Connection-string masking for logs.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

const MASK: &str = "***MASKED***";

static SECRET_PAIR: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(PWD|PASSWORD|UID)=([^;]+)").ok());

/// Mask credentials in an ODBC-style `KEY=value;` connection string.
///
/// `PWD`/`PASSWORD` values are replaced entirely, `UID` keeps its first two
/// characters. Keys match case-insensitively.
pub fn mask_dsn(dsn: &str) -> String {
    if dsn.is_empty() {
        return String::new();
    }
    let Some(re) = SECRET_PAIR.as_ref() else {
        return MASK.to_string();
    };
    re.replace_all(dsn, |caps: &Captures<'_>| {
        let key = &caps[1];
        let value = &caps[2];
        if key.eq_ignore_ascii_case("UID") {
            let prefix: String = value.chars().take(2).collect();
            format!("{key}={prefix}***")
        } else {
            format!("{key}={MASK}")
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_passwords_and_user() {
        let dsn = "DRIVER={ODBC Driver 18};SERVER=db;UID=appuser;PWD=s3cr3t;DATABASE=main";
        assert_eq!(
            mask_dsn(dsn),
            "DRIVER={ODBC Driver 18};SERVER=db;UID=ap***;PWD=***MASKED***;DATABASE=main"
        );
    }

    #[test]
    fn test_case_insensitive_keys() {
        assert_eq!(mask_dsn("password=hunter2"), "password=***MASKED***");
        assert_eq!(mask_dsn("uid=x;pwd=y"), "uid=x***;pwd=***MASKED***");
    }

    #[test]
    fn test_plain_strings_untouched() {
        assert_eq!(mask_dsn("SERVER=db;DATABASE=main"), "SERVER=db;DATABASE=main");
        assert_eq!(mask_dsn(""), "");
    }
}
