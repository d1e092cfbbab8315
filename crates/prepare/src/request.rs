//! Build request validation.
//!
//! Turns the untrusted request document into a [`BuildRequest`] whose
//! invariants hold for the rest of the pipeline: rooted, unique override
//! paths, string-only header maps, non-empty mime types and non-zero status
//! codes. Anything else is rejected rather than repaired; the only
//! normalizations are the documented `null`/omitted defaults and dropping
//! `null`-valued map entries.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Header names (or env-replacement keys) to values.
pub type Headers = BTreeMap<String, String>;

/// A request or manifest that breaks one of the request invariants.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Request is not valid JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("The build request must be a JSON object")]
    NotAnObject,

    #[error("{field} must be a string-string object")]
    InvalidStringMap { field: String },

    #[error("files property must be an array")]
    FilesNotArray,

    #[error("Each file must be an object")]
    FileNotObject,

    #[error("Each file must have a path")]
    MissingPath,

    #[error("File path `{path}` must be non-empty and start with `/`")]
    PathNotRooted { path: String },

    #[error("The mime-type for `{path}` must be omitted (auto-detected) or a string")]
    InvalidMime { path: String },

    #[error("The mime-type for `{path}` must not be empty")]
    EmptyMime { path: String },

    #[error("The status-code for `{path}` must be omitted (default: 200) or an integer between 1 and 65535")]
    InvalidStatusCode { path: String },

    #[error("The status-code for `{path}` must not be 0")]
    ZeroStatusCode { path: String },

    #[error("File path `{path}` is listed more than once in files")]
    DuplicatePath { path: String },

    #[error("catchAllFile `{path}` must not also be listed in files")]
    CatchAllOverlap { path: String },

    #[error("aliases property must be an array")]
    AliasesNotArray,

    #[error("Each alias must be an object with non-empty string `from` and `to`")]
    InvalidAlias,

    #[error("Could not determine mime-type for {path}")]
    MimeUndetermined { path: String },

    #[error("catch-all file {path} is missing from discovered files")]
    CatchAllMissing { path: String },
}

/// Serving metadata the user wants applied to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOverride {
    pub path: String,
    pub mime: Option<String>,
    pub status_code: Option<u16>,
    pub headers: Headers,
    pub env_replacements: Headers,
}

/// Path alias handed through to the server untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alias {
    pub from: String,
    pub to: String,
}

/// A validated build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub global_headers: Headers,
    pub files: Vec<FileOverride>,
    pub catch_all_file: Option<FileOverride>,
    pub aliases: Vec<Alias>,
}

impl BuildRequest {
    /// Exact-path index over `files` plus the catch-all declaration.
    pub fn overrides_by_path(&self) -> HashMap<&str, &FileOverride> {
        self.files
            .iter()
            .chain(self.catch_all_file.iter())
            .map(|file| (file.path.as_str(), file))
            .collect()
    }
}

/// Parses request JSON text and validates it.
pub fn parse_request(text: &str) -> Result<BuildRequest, ValidationError> {
    let raw: Value = serde_json::from_str(text)?;
    validate(&raw)
}

/// Validates a raw request document.
pub fn validate(raw: &Value) -> Result<BuildRequest, ValidationError> {
    let raw = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let global_headers = validate_string_map(raw.get("globalHeaders"), || {
        "globalHeaders".to_string()
    })?;

    let files = match raw.get("files") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .map(validate_file)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(ValidationError::FilesNotArray),
    };

    let mut seen = HashSet::new();
    for file in &files {
        if !seen.insert(file.path.as_str()) {
            return Err(ValidationError::DuplicatePath {
                path: file.path.clone(),
            });
        }
    }

    let catch_all_file = match raw.get("catchAllFile") {
        None | Some(Value::Null) => None,
        Some(value) => Some(validate_file(value)?),
    };
    if let Some(catch_all) = &catch_all_file {
        if seen.contains(catch_all.path.as_str()) {
            return Err(ValidationError::CatchAllOverlap {
                path: catch_all.path.clone(),
            });
        }
    }

    let aliases = match raw.get("aliases") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .map(validate_alias)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(ValidationError::AliasesNotArray),
    };

    Ok(BuildRequest {
        global_headers,
        files,
        catch_all_file,
        aliases,
    })
}

fn validate_file(value: &Value) -> Result<FileOverride, ValidationError> {
    let file = value.as_object().ok_or(ValidationError::FileNotObject)?;

    let path = match file.get("path") {
        Some(Value::String(path)) => path.clone(),
        _ => return Err(ValidationError::MissingPath),
    };
    if !path.starts_with('/') {
        return Err(ValidationError::PathNotRooted { path });
    }

    let mime = match file.get("mime") {
        None | Some(Value::Null) => None,
        Some(Value::String(mime)) if mime.is_empty() => {
            return Err(ValidationError::EmptyMime { path })
        }
        Some(Value::String(mime)) => Some(mime.clone()),
        Some(_) => return Err(ValidationError::InvalidMime { path }),
    };

    let status_code = validate_status_code(file, &path)?;

    let headers = validate_string_map(file.get("headers"), || format!("headers of `{path}`"))?;
    let env_replacements = validate_string_map(file.get("envReplacements"), || {
        format!("envReplacements of `{path}`")
    })?;

    Ok(FileOverride {
        path,
        mime,
        status_code,
        headers,
        env_replacements,
    })
}

fn validate_status_code(
    file: &Map<String, Value>,
    path: &str,
) -> Result<Option<u16>, ValidationError> {
    let number = match file.get("statusCode") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number,
        Some(_) => {
            return Err(ValidationError::InvalidStatusCode {
                path: path.to_string(),
            })
        }
    };

    // 0.0 counts as zero too, so check the float view before the integer one
    if number.as_f64() == Some(0.0) {
        return Err(ValidationError::ZeroStatusCode {
            path: path.to_string(),
        });
    }

    number
        .as_u64()
        .and_then(|code| u16::try_from(code).ok())
        .map(Some)
        .ok_or_else(|| ValidationError::InvalidStatusCode {
            path: path.to_string(),
        })
}

fn validate_string_map(
    value: Option<&Value>,
    field: impl Fn() -> String,
) -> Result<Headers, ValidationError> {
    let map = match value {
        None | Some(Value::Null) => return Ok(Headers::new()),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ValidationError::InvalidStringMap { field: field() }),
    };

    let mut headers = Headers::new();
    for (key, val) in map {
        match val {
            Value::Null => {}
            Value::String(s) => {
                headers.insert(key.clone(), s.clone());
            }
            _ => return Err(ValidationError::InvalidStringMap { field: field() }),
        }
    }
    Ok(headers)
}

fn validate_alias(value: &Value) -> Result<Alias, ValidationError> {
    let alias = value.as_object().ok_or(ValidationError::InvalidAlias)?;
    match (alias.get("from"), alias.get("to")) {
        (Some(Value::String(from)), Some(Value::String(to))) if !from.is_empty() && !to.is_empty() => {
            Ok(Alias {
                from: from.clone(),
                to: to.clone(),
            })
        }
        _ => Err(ValidationError::InvalidAlias),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_all_optional_values_missing() {
        let request = validate(&json!({})).unwrap();

        assert!(request.global_headers.is_empty());
        assert!(request.files.is_empty());
        assert!(request.catch_all_file.is_none());
        assert!(request.aliases.is_empty());
    }

    #[test]
    fn test_all_optional_values_null() {
        let request = validate(&json!({
            "globalHeaders": null,
            "files": null,
            "catchAllFile": null,
            "aliases": null,
        }))
        .unwrap();

        assert_eq!(
            request,
            BuildRequest {
                global_headers: Headers::new(),
                files: vec![],
                catch_all_file: None,
                aliases: vec![],
            }
        );
    }

    #[test]
    fn test_null_header_values_are_dropped() {
        let request = validate(&json!({
            "globalHeaders": { "A": "a", "B": null },
            "files": [{ "path": "/a", "headers": { "X": "1", "Y": null } }],
        }))
        .unwrap();

        assert_eq!(request.global_headers.len(), 1);
        assert_eq!(request.global_headers["A"], "a");
        let headers = &request.files[0].headers;
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["X"], "1");
    }

    #[test]
    fn test_file_defaults() {
        let request = validate(&json!({ "files": [{ "path": "/abc" }] })).unwrap();

        assert_eq!(
            request.files[0],
            FileOverride {
                path: "/abc".to_string(),
                mime: None,
                status_code: None,
                headers: Headers::new(),
                env_replacements: Headers::new(),
            }
        );
    }

    #[test]
    fn test_full_file_override() {
        let request = validate(&json!({
            "files": [{
                "path": "/index.html",
                "mime": "text/html; charset=utf-8",
                "statusCode": 200,
                "headers": { "Cache-Control": "no-cache" },
                "envReplacements": { "API_URL": "__API_URL__" },
            }],
            "catchAllFile": { "path": "/404.html", "statusCode": 404 },
            "aliases": [{ "from": "/old", "to": "/new" }],
        }))
        .unwrap();

        let file = &request.files[0];
        assert_eq!(file.mime.as_deref(), Some("text/html; charset=utf-8"));
        assert_eq!(file.status_code, Some(200));
        assert_eq!(file.headers["Cache-Control"], "no-cache");
        assert_eq!(file.env_replacements["API_URL"], "__API_URL__");
        assert_eq!(request.catch_all_file.as_ref().unwrap().status_code, Some(404));
        assert_eq!(
            request.aliases,
            vec![Alias {
                from: "/old".to_string(),
                to: "/new".to_string()
            }]
        );
    }

    #[test]
    fn test_invalid_global_headers_rejected() {
        for global_headers in [
            json!(1),
            json!("abc"),
            json!([]),
            json!(true),
            json!({ "abc": 1 }),
            json!({ "abc": true }),
            json!({ "abc": [] }),
            json!({ "abc": {} }),
        ] {
            let input = json!({ "globalHeaders": global_headers });
            assert!(
                matches!(validate(&input), Err(ValidationError::InvalidStringMap { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_invalid_files_rejected() {
        let cases = [
            ("number", json!({ "files": 1 })),
            ("false", json!({ "files": false })),
            ("object", json!({ "files": {} })),
            ("containing number", json!({ "files": [1] })),
            ("containing false", json!({ "files": [false] })),
            ("containing array", json!({ "files": [[]] })),
            ("missing path", json!({ "files": [{}] })),
            ("empty path", json!({ "files": [{ "path": "" }] })),
            ("path not rooted", json!({ "files": [{ "path": "abc" }] })),
            ("mime is number", json!({ "files": [{ "path": "/abc", "mime": 1 }] })),
            ("mime is false", json!({ "files": [{ "path": "/abc", "mime": false }] })),
            ("mime is object", json!({ "files": [{ "path": "/abc", "mime": {} }] })),
            ("mime is array", json!({ "files": [{ "path": "/abc", "mime": [] }] })),
            ("mime is empty", json!({ "files": [{ "path": "/abc", "mime": "" }] })),
            ("status is string", json!({ "files": [{ "path": "/abc", "statusCode": "1" }] })),
            ("status is 0", json!({ "files": [{ "path": "/abc", "statusCode": 0 }] })),
            ("status is negative", json!({ "files": [{ "path": "/abc", "statusCode": -1 }] })),
            ("status is fraction", json!({ "files": [{ "path": "/abc", "statusCode": 200.5 }] })),
            ("status too large", json!({ "files": [{ "path": "/abc", "statusCode": 70000 }] })),
            ("status is array", json!({ "files": [{ "path": "/abc", "statusCode": [] }] })),
            ("status is false", json!({ "files": [{ "path": "/abc", "statusCode": false }] })),
            ("headers is number", json!({ "files": [{ "path": "/abc", "headers": 0 }] })),
            ("headers is string", json!({ "files": [{ "path": "/abc", "headers": "" }] })),
            ("headers is array", json!({ "files": [{ "path": "/abc", "headers": [] }] })),
            ("header value false", json!({ "files": [{ "path": "/abc", "headers": { "a": false } }] })),
            ("env value number", json!({ "files": [{ "path": "/abc", "envReplacements": { "a": 1 } }] })),
            ("duplicate path", json!({ "files": [{ "path": "/abc" }, { "path": "/abc" }] })),
            (
                "overlapping catchAllFile",
                json!({ "files": [{ "path": "/abc" }], "catchAllFile": { "path": "/abc" } }),
            ),
        ];

        for (description, input) in cases {
            assert!(validate(&input).is_err(), "{description} should be rejected");
        }
    }

    #[test]
    fn test_invalid_catch_all_rejected() {
        for catch_all in [
            json!(1),
            json!(false),
            json!([]),
            json!({}),
            json!({ "path": "abc" }),
            json!({ "path": "/abc", "mime": "" }),
            json!({ "path": "/abc", "statusCode": 0 }),
            json!({ "path": "/abc", "headers": { "a": {} } }),
        ] {
            let input = json!({ "catchAllFile": catch_all });
            assert!(validate(&input).is_err(), "{input} should be rejected");
        }
    }

    #[test]
    fn test_zero_status_code_has_specific_error() {
        let result = validate(&json!({ "files": [{ "path": "/abc", "statusCode": 0 }] }));
        assert!(matches!(result, Err(ValidationError::ZeroStatusCode { path }) if path == "/abc"));
    }

    #[test]
    fn test_invalid_aliases_rejected() {
        for aliases in [
            json!({}),
            json!([1]),
            json!([{ "from": "/a" }]),
            json!([{ "from": "", "to": "/b" }]),
            json!([{ "from": "/a", "to": 2 }]),
        ] {
            let input = json!({ "aliases": aliases });
            assert!(validate(&input).is_err(), "{input} should be rejected");
        }
    }

    #[test]
    fn test_non_object_request_rejected() {
        assert!(matches!(validate(&json!([])), Err(ValidationError::NotAnObject)));
        assert!(matches!(
            parse_request("{ not json"),
            Err(ValidationError::MalformedJson(_))
        ));
    }

    #[test]
    fn test_overrides_by_path_includes_catch_all() {
        let request = validate(&json!({
            "files": [{ "path": "/a" }],
            "catchAllFile": { "path": "/404.html", "statusCode": 404 },
        }))
        .unwrap();

        let index = request.overrides_by_path();
        assert_eq!(index.len(), 2);
        assert_eq!(index["/404.html"].status_code, Some(404));
        assert!(index.contains_key("/a"));
    }

    fn string_map_strategy() -> impl Strategy<Value = BTreeMap<String, Option<String>>> {
        proptest::collection::btree_map("[A-Za-z-]{1,12}", proptest::option::of("[ -~]{0,16}"), 0..4)
    }

    fn file_strategy() -> impl Strategy<Value = Value> {
        (
            "/[a-z0-9/._-]{0,20}",
            proptest::option::of("[a-z]{1,8}/[a-z0-9.+-]{1,12}"),
            proptest::option::of(1u16..=u16::MAX),
            string_map_strategy(),
            string_map_strategy(),
        )
            .prop_map(|(path, mime, status, headers, env)| {
                json!({
                    "path": path,
                    "mime": mime,
                    "statusCode": status,
                    "headers": headers,
                    "envReplacements": env,
                })
            })
    }

    // Validating the normalized output again yields an identical request
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_validation_is_idempotent(
            global_headers in string_map_strategy(),
            files in proptest::collection::vec(file_strategy(), 0..5),
            catch_all in proptest::option::of(file_strategy()),
            aliases in proptest::collection::vec(("/[a-z]{1,8}", "/[a-z]{1,8}"), 0..3),
        ) {
            let raw = json!({
                "globalHeaders": global_headers,
                "files": files,
                "catchAllFile": catch_all,
                "aliases": aliases
                    .iter()
                    .map(|(from, to)| json!({ "from": from, "to": to }))
                    .collect::<Vec<_>>(),
            });

            // Generated paths may collide; those requests are legitimately rejected
            let Ok(first) = validate(&raw) else {
                return Ok(());
            };

            let normalized = serde_json::to_value(&first).unwrap();
            let second = validate(&normalized).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(normalized, serde_json::to_value(&second).unwrap());

            let expected_globals = global_headers.values().filter(|v| v.is_some()).count();
            prop_assert_eq!(first.global_headers.len(), expected_globals);
        }
    }
}
