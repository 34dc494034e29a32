//! Environment overrides for runtime settings.
use std::collections::HashMap;
use std::time::Duration;

use pimon::config::Settings;

fn from(pairs: &[(&str, &str)]) -> Settings {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Settings::from_lookup(|k| map.get(k).cloned())
}

#[test]
fn test_defaults() {
    let s = from(&[]);
    assert_eq!(s, Settings::default());
    assert_eq!(s.refresh_interval, Duration::from_secs(6));
    assert_eq!(s.http_timeout, Duration::from_millis(5000));
    assert_eq!(s.keepalive, Duration::from_secs(30));
    assert_eq!(s.default_port, 3000);
}

#[test]
fn test_overrides() {
    let s = from(&[
        ("PIMON_REFRESH_SECS", "2"),
        ("PIMON_HTTP_TIMEOUT_MS", " 750 "),
        ("PIMON_KEEPALIVE_SECS", "10"),
        ("PIMON_PORT", "8080"),
    ]);
    assert_eq!(s.refresh_interval, Duration::from_secs(2));
    assert_eq!(s.http_timeout, Duration::from_millis(750));
    assert_eq!(s.keepalive, Duration::from_secs(10));
    assert_eq!(s.default_port, 8080);
}

#[test]
fn test_bad_values_keep_defaults_and_zero_is_floored() {
    let s = from(&[
        ("PIMON_REFRESH_SECS", "0"),
        ("PIMON_PORT", "99999"),
        ("PIMON_KEEPALIVE_SECS", "soon"),
    ]);
    assert_eq!(s.refresh_interval, Duration::from_secs(1));
    assert_eq!(s.default_port, 3000);
    assert_eq!(s.keepalive, Duration::from_secs(30));
}

#[test]
fn test_http_timeout_has_a_floor() {
    let s = from(&[("PIMON_HTTP_TIMEOUT_MS", "0")]);
    assert_eq!(s.http_timeout, Duration::from_millis(100));
    let s = from(&[("PIMON_HTTP_TIMEOUT_MS", "250")]);
    assert_eq!(s.http_timeout, Duration::from_millis(250));
}
