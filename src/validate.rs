use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};

/// URL-safe business descriptor.
pub static DESCRIPTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]{3,50}$").expect("descriptor regex"));

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

/// Collects field-level failures so a request surfaces every problem at once
/// in a single `validation_failed` response.
#[derive(Default)]
pub struct Check {
    fields: BTreeMap<String, String>,
}

impl Check {
    pub fn new() -> Self {
        Check::default()
    }

    pub fn require(&mut self, field: &str, ok: bool, message: &str) -> &mut Self {
        if !ok && !self.fields.contains_key(field) {
            self.fields.insert(field.to_string(), message.to_string());
        }
        self
    }

    pub fn require_present(&mut self, field: &str, value: &str) -> &mut Self {
        self.require(field, !value.trim().is_empty(), "required")
    }

    pub fn require_email(&mut self, field: &str, value: &str) -> &mut Self {
        self.require(field, EMAIL.is_match(value.trim()), "invalid email")
    }

    pub fn require_descriptor(&mut self, field: &str, value: &str) -> &mut Self {
        self.require(
            field,
            DESCRIPTOR.is_match(value),
            "must match ^[a-z0-9-]{3,50}$",
        )
    }

    pub fn require_min_len(&mut self, field: &str, value: &str, min: usize) -> &mut Self {
        self.require(
            field,
            value.len() >= min,
            &format!("must be at least {min} characters"),
        )
    }

    pub fn require_range_i32(&mut self, field: &str, value: i32, min: i32, max: i32) -> &mut Self {
        self.require(
            field,
            (min..=max).contains(&value),
            &format!("must be between {min} and {max}"),
        )
    }

    pub fn finish(self) -> AppResult<()> {
        if self.fields.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(self.fields))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_every_failing_field() {
        let mut check = Check::new();
        check
            .require_email("email", "not-an-email")
            .require_descriptor("descriptor", "X!")
            .require_min_len("password", "short", 8);
        let err = check.finish().unwrap_err();
        match err {
            AppError::Validation(fields) => {
                assert_eq!(fields.len(), 3);
                assert!(fields.contains_key("email"));
                assert!(fields.contains_key("descriptor"));
                assert!(fields.contains_key("password"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn first_failure_per_field_wins() {
        let mut check = Check::new();
        check
            .require_present("name", "")
            .require_min_len("name", "", 3);
        let err = check.finish().unwrap_err();
        match err {
            AppError::Validation(fields) => assert_eq!(fields["name"], "required"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn descriptor_boundaries() {
        assert!(DESCRIPTOR.is_match("abc"));
        assert!(DESCRIPTOR.is_match("my-shop-42"));
        assert!(!DESCRIPTOR.is_match("ab"));
        assert!(!DESCRIPTOR.is_match("Shop"));
        assert!(!DESCRIPTOR.is_match(&"a".repeat(51)));
    }

    #[test]
    fn clean_check_passes() {
        let mut check = Check::new();
        check
            .require_email("email", "a@b.co")
            .require_descriptor("descriptor", "shop");
        assert!(check.finish().is_ok());
    }
}
