//! Context functions exposed to templates (spec §4.4). The active
//! [`crate::backend::KeyStore`] for a render is carried as a minijinja
//! object under the reserved `__store` global and looked up from inside
//! each function via [`minijinja::State`], the same indirection the
//! teacher uses to thread its SQL capture map into `minijinja` functions
//! (`build_env_with_captures`).

use std::fmt;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use base64::Engine;
use globset::Glob;
use minijinja::value::{Object, Value};
use minijinja::{Error, ErrorKind, State};

use crate::backend::KeyStore;

/// Wraps a [`KeyStore`] so it can travel through minijinja's `Value` type
/// as the `__store` global.
#[derive(Debug)]
pub struct StoreObject(pub KeyStore);

impl fmt::Display for StoreObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<key store, {} entries>", self.0.len())
    }
}

impl Object for StoreObject {}

fn store_from_state(state: &State) -> Result<Arc<StoreObject>, Error> {
    state
        .lookup("__store")
        .and_then(|v| v.downcast_object::<StoreObject>())
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "no key store bound to this render"))
}

fn render_err(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

/// `getv(key, [default])`: exact lookup; fails the render if absent and no
/// default was given (spec §4.4).
pub fn getv(state: &State, key: String, default: Option<Value>) -> Result<Value, Error> {
    let store = store_from_state(state)?;
    match store.0.get(&key) {
        Some(v) => Ok(Value::from(v)),
        None => match default {
            Some(d) => Ok(d),
            None => Err(render_err(format!("key not found: {key}"))),
        },
    }
}

/// `exists(key)`: boolean presence check (spec §4.4).
pub fn exists(state: &State, key: String) -> Result<bool, Error> {
    let store = store_from_state(state)?;
    Ok(store.0.contains_key(&key))
}

/// `gets(glob)`: `{key, value}` records whose key matches `glob`
/// (wildcard on path segments) (spec §4.4).
pub fn gets(state: &State, glob: String) -> Result<Vec<Value>, Error> {
    let store = store_from_state(state)?;
    let matcher = Glob::new(&glob)
        .map_err(|e| render_err(format!("invalid glob {glob:?}: {e}")))?
        .compile_matcher();
    let mut out = Vec::new();
    for (k, v) in store.0.iter() {
        if matcher.is_match(k) {
            out.push(Value::from_serialize(&serde_json::json!({"Key": k, "Value": v})));
        }
    }
    Ok(out)
}

/// `getvs(glob)`: values only, same matching as `gets` (spec §4.4).
pub fn getvs(state: &State, glob: String) -> Result<Vec<Value>, Error> {
    let store = store_from_state(state)?;
    let matcher = Glob::new(&glob)
        .map_err(|e| render_err(format!("invalid glob {glob:?}: {e}")))?
        .compile_matcher();
    let mut out = Vec::new();
    for (k, v) in store.0.iter() {
        if matcher.is_match(k) {
            out.push(Value::from(v.clone()));
        }
    }
    Ok(out)
}

/// `getenv(name, [default])`: process environment lookup (spec §4.4).
pub fn getenv(name: String, default: Option<String>) -> Option<String> {
    std::env::var(&name).ok().or(default)
}

pub fn base(p: String) -> String {
    std::path::Path::new(&p)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or(p)
}

pub fn dir(p: String) -> String {
    std::path::Path::new(&p)
        .parent()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

pub fn split(s: String, sep: String) -> Vec<String> {
    if sep.is_empty() {
        s.chars().map(|c| c.to_string()).collect()
    } else {
        s.split(sep.as_str()).map(|p| p.to_string()).collect()
    }
}

pub fn join(list: Vec<String>, sep: String) -> String {
    list.join(&sep)
}

/// `base64Encode(s)` / `base64Decode(s)` (spec §4.4).
pub fn base64_encode(s: String) -> String {
    base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
}

pub fn base64_decode(s: String) -> Result<String, Error> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| render_err(format!("invalid base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| render_err(format!("decoded bytes are not utf-8: {e}")))
}

/// `json(s)`: parse a JSON document string into a mapping (spec §4.4).
pub fn json(s: String) -> Result<Value, Error> {
    let parsed: serde_json::Value =
        serde_json::from_str(&s).map_err(|e| render_err(format!("invalid json: {e}")))?;
    Ok(Value::from_serialize(&parsed))
}

/// `jsonArray(s)`: parse a JSON document string into a sequence (spec §4.4).
pub fn json_array(s: String) -> Result<Vec<Value>, Error> {
    let parsed: Vec<serde_json::Value> =
        serde_json::from_str(&s).map_err(|e| render_err(format!("invalid json array: {e}")))?;
    Ok(parsed.iter().map(Value::from_serialize).collect())
}

/// `lookupIP(host)`: DNS A/AAAA lookup (spec §4.4).
pub fn lookup_ip(host: String) -> Result<Vec<String>, Error> {
    let target = format!("{host}:0");
    let addrs = target
        .to_socket_addrs()
        .map_err(|e| render_err(format!("dns lookup failed for {host:?}: {e}")))?;
    Ok(addrs.map(|a| a.ip().to_string()).collect())
}

pub fn reverse(mut list: Vec<Value>) -> Vec<Value> {
    list.reverse();
    list
}

/// `parseBool(s)`: accepts `true/false/1/0` case-insensitively (spec §4.4).
pub fn parse_bool(s: String) -> Result<bool, Error> {
    match s.to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(render_err(format!("cannot parse {s:?} as bool"))),
    }
}

/// `map(k1, v1, k2, v2, ...)`: constructs an ad-hoc mapping, used to pass
/// keyword arguments to included templates (spec §4.4).
pub fn map_fn(args: Vec<Value>) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(render_err("map() requires an even number of arguments"));
    }
    let mut out = serde_json::Map::new();
    for pair in args.chunks(2) {
        let key = pair[0].to_string();
        let value: serde_json::Value =
            serde_json::from_str(&pair[1].to_string()).unwrap_or_else(|_| serde_json::Value::String(pair[1].to_string()));
        out.insert(key, value);
    }
    Ok(Value::from_serialize(&serde_json::Value::Object(out)))
}

// Obvious string ops (spec §4.4).

pub fn to_upper(s: String) -> String {
    s.to_uppercase()
}

pub fn to_lower(s: String) -> String {
    s.to_lowercase()
}

pub fn replace(s: String, from: String, to: String) -> String {
    s.replace(&from, &to)
}

pub fn trim_suffix(s: String, suffix: String) -> String {
    s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string()
}

pub fn contains(s: String, substr: String) -> bool {
    s.contains(&substr)
}

// Integer arithmetic (spec §4.4).

fn parse_int(s: &str) -> Result<i64, Error> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| render_err(format!("not an integer: {s:?} ({e})")))
}

pub fn atoi(s: String) -> Result<i64, Error> {
    parse_int(&s)
}

pub fn add(a: i64, b: i64) -> i64 {
    a + b
}

pub fn sub(a: i64, b: i64) -> i64 {
    a - b
}

pub fn mul(a: i64, b: i64) -> i64 {
    a * b
}

pub fn div(a: i64, b: i64) -> Result<i64, Error> {
    if b == 0 {
        return Err(render_err("division by zero"));
    }
    Ok(a / b)
}

pub fn mod_(a: i64, b: i64) -> Result<i64, Error> {
    if b == 0 {
        return Err(render_err("modulo by zero"));
    }
    Ok(a % b)
}

/// `seq(from, to)`: an inclusive integer sequence (spec §4.4).
pub fn seq(from: i64, to: i64) -> Vec<i64> {
    if from <= to {
        (from..=to).collect()
    } else {
        (to..=from).rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_returns_file_name() {
        assert_eq!(base("/etc/confr/app.conf".to_string()), "app.conf");
    }

    #[test]
    fn test_dir_returns_parent() {
        assert_eq!(dir("/etc/confr/app.conf".to_string()), "/etc/confr");
    }

    #[test]
    fn test_split_and_join_round_trip() {
        let parts = split("a,b,c".to_string(), ",".to_string());
        assert_eq!(parts, vec!["a", "b", "c"]);
        assert_eq!(join(parts, "-".to_string()), "a-b-c");
    }

    #[test]
    fn test_base64_round_trip() {
        let encoded = base64_encode("hello".to_string());
        assert_eq!(base64_decode(encoded).unwrap(), "hello");
    }

    #[test]
    fn test_parse_bool_accepts_common_forms() {
        assert!(parse_bool("TRUE".to_string()).unwrap());
        assert!(parse_bool("1".to_string()).unwrap());
        assert!(!parse_bool("false".to_string()).unwrap());
        assert!(!parse_bool("0".to_string()).unwrap());
    }

    #[test]
    fn test_parse_bool_rejects_other_values() {
        assert!(parse_bool("yes".to_string()).is_err());
    }

    #[test]
    fn test_string_ops() {
        assert_eq!(to_upper("abc".to_string()), "ABC");
        assert_eq!(to_lower("ABC".to_string()), "abc");
        assert_eq!(replace("a-b-c".to_string(), "-".to_string(), "_".to_string()), "a_b_c");
        assert_eq!(trim_suffix("app.conf".to_string(), ".conf".to_string()), "app");
        assert!(contains("hello world".to_string(), "world".to_string()));
    }

    #[test]
    fn test_arithmetic_ops() {
        assert_eq!(atoi("42".to_string()).unwrap(), 42);
        assert_eq!(add(2, 3), 5);
        assert_eq!(sub(5, 2), 3);
        assert_eq!(mul(3, 4), 12);
        assert_eq!(div(10, 2).unwrap(), 5);
        assert_eq!(mod_(10, 3).unwrap(), 1);
    }

    #[test]
    fn test_div_by_zero_errors() {
        assert!(div(1, 0).is_err());
    }

    #[test]
    fn test_seq_ascending() {
        assert_eq!(seq(1, 3), vec![1, 2, 3]);
    }

    #[test]
    fn test_seq_descending() {
        assert_eq!(seq(3, 1), vec![3, 2, 1]);
    }
}
