use std::collections::BTreeMap;

pub const REDACTED: &str = "***";

/// Interpolate `${name}` patterns from the resolved flow variables.
/// Unknown names are left in place so they show up in step errors.
pub fn interpolate_vars(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();
    let mut start = 0;

    loop {
        let open = match result[start..].find("${") {
            Some(pos) => start + pos,
            None => break,
        };

        let close = match result[open..].find('}') {
            Some(pos) => open + pos,
            None => break,
        };

        let name = result[open + 2..close].trim().to_string();
        match vars.get(&name) {
            Some(value) => {
                let value = value.clone();
                result.replace_range(open..=close, &value);
                start = open + value.len();
            }
            None => start = close + 1,
        }
    }

    result
}

/// Interpolate every string inside a JSON value.
pub fn interpolate_value(
    value: &serde_json::Value,
    vars: &BTreeMap<String, String>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(interpolate_vars(s, vars)),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|v| interpolate_value(v, vars)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Copy of `vars` with secret values replaced.
pub fn redact_secrets(
    vars: &BTreeMap<String, String>,
    secrets: &[String],
) -> BTreeMap<String, String> {
    vars.iter()
        .map(|(k, v)| {
            if secrets.contains(k) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_simple_interpolation() {
        let v = vars(&[("base_url", "https://app.test")]);
        assert_eq!(
            interpolate_vars("${base_url}/login", &v),
            "https://app.test/login"
        );
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        let v = vars(&[("a", "1")]);
        assert_eq!(interpolate_vars("${a}-${b}-${a}", &v), "1-${b}-1");
    }

    #[test]
    fn test_value_interpolation() {
        let v = vars(&[("q", "invoices")]);
        let out = interpolate_value(&serde_json::json!({"query": "${q}", "n": 3}), &v);
        assert_eq!(out, serde_json::json!({"query": "invoices", "n": 3}));
    }

    #[test]
    fn test_redaction() {
        let v = vars(&[("username", "qa-test"), ("password", "hunter2")]);
        let redacted = redact_secrets(&v, &["password".to_string()]);
        assert_eq!(redacted["password"], REDACTED);
        assert_eq!(redacted["username"], "qa-test");
    }
}
