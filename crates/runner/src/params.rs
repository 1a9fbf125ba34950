//! Parameter resolution
//!
//! Builds the immutable [`TestParams`] record from defaults,
//! environment variables and command-line overrides. Both lookup
//! sources are injected as closures so resolution stays pure; the
//! binary supplies `std::env::var` and its clap matches.
//!
//! Precedence per field: command line > environment > default. An
//! empty command-line value is treated as absent and falls through to
//! the environment; an environment variable that exists always
//! applies, even when empty.

use loggest_common::{Error, Result, TestParams};
use tracing::info;

/// Command-line key for the required test module name.
pub const TEST_NAME_ARG: &str = "test-name";

/// Prefix for per-field command-line overrides (`test-param-<field>`).
pub const TEST_PARAM_PREFIX: &str = "test-param-";

/// One overridable parameter field.
#[derive(Debug, Clone, Copy)]
pub struct ParamMapping {
    /// Field name as it appears in `test-param-<field>` and in the
    /// serialized params.
    pub field: &'static str,
    /// Environment variable carrying the same field at lower
    /// precedence.
    pub env_var: &'static str,
    /// Boolean fields coerce any non-empty override to `true`.
    pub boolean: bool,
}

/// The recognized override fields. `name` is deliberately absent: the
/// display name has no override source.
pub const ENV_MAPPINGS: &[ParamMapping] = &[
    ParamMapping {
        field: "emailAddress",
        env_var: "GELAM_TEST_ACCOUNT",
        boolean: false,
    },
    ParamMapping {
        field: "password",
        env_var: "GELAM_TEST_PASSWORD",
        boolean: false,
    },
    ParamMapping {
        field: "type",
        env_var: "GELAM_TEST_ACCOUNT_TYPE",
        boolean: false,
    },
    ParamMapping {
        field: "slow",
        env_var: "GELAM_TEST_ACCOUNT_SLOW",
        boolean: true,
    },
];

/// Resolve the test parameters from the injected lookup sources.
pub fn resolve(
    defaults: TestParams,
    env_lookup: impl Fn(&str) -> Option<String>,
    arg_lookup: impl Fn(&str) -> Option<String>,
) -> TestParams {
    let mut params = defaults;

    for mapping in ENV_MAPPINGS {
        let arg_key = format!("{}{}", TEST_PARAM_PREFIX, mapping.field);
        let arg_value = arg_lookup(&arg_key).filter(|v| !v.is_empty());

        if let Some(value) = arg_value {
            info!(field = mapping.field, value = %value, "command line override");
            apply(&mut params, mapping, &value);
        } else if let Some(value) = env_lookup(mapping.env_var) {
            info!(field = mapping.field, value = %value, "environment override");
            apply(&mut params, mapping, &value);
        }
    }

    params
}

/// Resolve the required test module name. A trailing `.js` is
/// stripped; absence is a fatal configuration error reported before any
/// context is created.
pub fn resolve_test_name(arg_lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let raw = arg_lookup(TEST_NAME_ARG)
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingTestName)?;
    Ok(raw.strip_suffix(".js").unwrap_or(&raw).to_string())
}

fn apply(params: &mut TestParams, mapping: &ParamMapping, value: &str) {
    match mapping.field {
        "emailAddress" => params.email_address = value.to_string(),
        "password" => params.password = value.to_string(),
        "type" => params.account_type = value.to_string(),
        "slow" => params.slow = !value.is_empty(),
        other => unreachable!("unmapped parameter field: {other}"),
    }
    // Overriding the account type alone does not disqualify a run from
    // "default parameters" status.
    if mapping.field != "type" {
        params.used_defaults = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    fn none(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn no_overrides_keeps_defaults() {
        let params = resolve(TestParams::default(), none, none);
        assert_eq!(params, TestParams::default());
        assert!(params.used_defaults);
    }

    #[test]
    fn command_line_beats_environment() {
        let env = HashMap::from([("GELAM_TEST_ACCOUNT", "env@host")]);
        let args = HashMap::from([("test-param-emailAddress", "cli@host")]);
        let params = resolve(TestParams::default(), lookup(&env), lookup(&args));
        assert_eq!(params.email_address, "cli@host");
        assert!(!params.used_defaults);
    }

    #[test]
    fn environment_applies_without_command_line() {
        let env = HashMap::from([("GELAM_TEST_PASSWORD", "hunter2")]);
        let params = resolve(TestParams::default(), lookup(&env), none);
        assert_eq!(params.password, "hunter2");
        assert!(!params.used_defaults);
    }

    #[test]
    fn type_override_alone_stays_default() {
        let args = HashMap::from([("test-param-type", "activesync")]);
        let params = resolve(TestParams::default(), none, lookup(&args));
        assert_eq!(params.account_type, "activesync");
        assert!(params.used_defaults);

        let env = HashMap::from([("GELAM_TEST_ACCOUNT_TYPE", "pop3")]);
        let params = resolve(TestParams::default(), lookup(&env), none);
        assert_eq!(params.account_type, "pop3");
        assert!(params.used_defaults);
    }

    #[test]
    fn type_plus_other_override_loses_default_status() {
        let args = HashMap::from([
            ("test-param-type", "activesync"),
            ("test-param-slow", "1"),
        ]);
        let params = resolve(TestParams::default(), none, lookup(&args));
        assert!(params.slow);
        assert!(!params.used_defaults);
    }

    #[test]
    fn boolean_coerces_any_nonempty_value() {
        let args = HashMap::from([("test-param-slow", "false")]);
        let params = resolve(TestParams::default(), none, lookup(&args));
        // Truthiness, not parsing: any non-empty string means true.
        assert!(params.slow);
    }

    #[test]
    fn empty_command_line_value_falls_through_to_environment() {
        let env = HashMap::from([("GELAM_TEST_ACCOUNT", "env@host")]);
        let args = HashMap::from([("test-param-emailAddress", "")]);
        let params = resolve(TestParams::default(), lookup(&env), lookup(&args));
        assert_eq!(params.email_address, "env@host");
    }

    #[test]
    fn empty_environment_boolean_is_false_but_applies() {
        let env = HashMap::from([("GELAM_TEST_ACCOUNT_SLOW", "")]);
        let params = resolve(TestParams::default(), lookup(&env), none);
        assert!(!params.slow);
        // The variable exists, so the run is no longer all-defaults.
        assert!(!params.used_defaults);
    }

    #[test]
    fn test_name_is_required() {
        let err = resolve_test_name(none).unwrap_err();
        assert!(matches!(err, Error::MissingTestName));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_name_strips_js_suffix() {
        let args = HashMap::from([("test-name", "test_foo_bar.js")]);
        assert_eq!(resolve_test_name(lookup(&args)).unwrap(), "test_foo_bar");

        let args = HashMap::from([("test-name", "test_foo_bar")]);
        assert_eq!(resolve_test_name(lookup(&args)).unwrap(), "test_foo_bar");
    }
}
