//! The fixed operation set and its argument codec
//!
//! Both sides of the bridge agree on positional argument lists:
//!
//! | method    | args                          |
//! |-----------|-------------------------------|
//! | count     | `[query]`                     |
//! | get       | `[query]`                     |
//! | create    | `[table, items]`              |
//! | update    | `[table, items]`              |
//! | delete    | `[query]`                     |
//! | index     | `[table, index_name, keys?]`  |
//! | find      | `[query]`                     |
//! | subscribe | `[query]` (plus a live callback) |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::query::{Item, Query};

/// Operation names accepted by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Count,
    Get,
    Create,
    Update,
    Delete,
    Index,
    Find,
    Subscribe,
}

impl Method {
    pub const ALL: [Method; 8] = [
        Method::Count,
        Method::Get,
        Method::Create,
        Method::Update,
        Method::Delete,
        Method::Index,
        Method::Find,
        Method::Subscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Count => "count",
            Method::Get => "get",
            Method::Create => "create",
            Method::Update => "update",
            Method::Delete => "delete",
            Method::Index => "index",
            Method::Find => "find",
            Method::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| BridgeError::UnknownOperation(s.to_string()))
    }
}

/// A decoded operation with typed arguments
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Count(Query),
    Get(Query),
    Create { table: String, items: Vec<Item> },
    Update { table: String, items: Vec<Item> },
    Delete(Query),
    Index { table: String, index: String, keys: Option<Vec<String>> },
    Find(Query),
    Subscribe(Query),
}

impl Call {
    /// Decode a method name and positional arguments
    pub fn parse(method: &str, args: Vec<Value>) -> BridgeResult<Self> {
        let method: Method = method.parse()?;
        let mut args = args.into_iter();

        let call = match method {
            Method::Count => Call::Count(query_arg(args.next())?),
            Method::Get => Call::Get(query_arg(args.next())?),
            Method::Delete => Call::Delete(query_arg(args.next())?),
            Method::Find => Call::Find(query_arg(args.next())?),
            Method::Subscribe => Call::Subscribe(query_arg(args.next())?),
            Method::Create => Call::Create {
                table: string_arg(args.next(), "table")?,
                items: items_arg(args.next())?,
            },
            Method::Update => Call::Update {
                table: string_arg(args.next(), "table")?,
                items: items_arg(args.next())?,
            },
            Method::Index => Call::Index {
                table: string_arg(args.next(), "table")?,
                index: string_arg(args.next(), "index name")?,
                keys: keys_arg(args.next())?,
            },
        };

        Ok(call)
    }

    pub fn method(&self) -> Method {
        match self {
            Call::Count(_) => Method::Count,
            Call::Get(_) => Method::Get,
            Call::Create { .. } => Method::Create,
            Call::Update { .. } => Method::Update,
            Call::Delete(_) => Method::Delete,
            Call::Index { .. } => Method::Index,
            Call::Find(_) => Method::Find,
            Call::Subscribe(_) => Method::Subscribe,
        }
    }

    /// Encode the positional argument list
    pub fn into_args(self) -> Vec<Value> {
        match self {
            Call::Count(query)
            | Call::Get(query)
            | Call::Delete(query)
            | Call::Find(query)
            | Call::Subscribe(query) => vec![query.to_value()],
            Call::Create { table, items } | Call::Update { table, items } => {
                vec![Value::String(table), Value::Array(items)]
            }
            Call::Index { table, index, keys } => vec![
                Value::String(table),
                Value::String(index),
                keys.map(|keys| Value::Array(keys.into_iter().map(Value::String).collect()))
                    .unwrap_or(Value::Null),
            ],
        }
    }
}

fn query_arg(arg: Option<Value>) -> BridgeResult<Query> {
    Query::from_value(arg.unwrap_or(Value::Null))
}

fn string_arg(arg: Option<Value>, what: &str) -> BridgeResult<String> {
    match arg {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(BridgeError::InvalidQuery(format!("{what} must be a non-empty string"))),
    }
}

fn items_arg(arg: Option<Value>) -> BridgeResult<Vec<Item>> {
    match arg {
        Some(Value::Array(items)) if items.iter().all(Value::is_object) => Ok(items),
        _ => Err(BridgeError::InvalidQuery("items must be an array of objects".into())),
    }
}

fn keys_arg(arg: Option<Value>) -> BridgeResult<Option<Vec<String>>> {
    match arg {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some).map_err(|_| {
            BridgeError::InvalidQuery("index keys must be an array of strings".into())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_names() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert_eq!(
            "truncate".parse::<Method>(),
            Err(BridgeError::UnknownOperation("truncate".into()))
        );
    }

    #[test]
    fn test_parse_index_with_optional_keys() {
        let call = Call::parse("index", vec![json!("users"), json!("by_email")]).unwrap();
        assert_eq!(
            call,
            Call::Index {
                table: "users".into(),
                index: "by_email".into(),
                keys: None
            }
        );

        let args = vec![json!("users"), json!("by_name"), json!(["first", "last"])];
        let call = Call::parse("index", args).unwrap();
        assert_eq!(call.clone().into_args()[2], json!(["first", "last"]));
        assert_eq!(call.method(), Method::Index);
    }

    #[test]
    fn test_parse_rejects_missing_query() {
        assert!(matches!(Call::parse("find", vec![]), Err(BridgeError::InvalidQuery(_))));
        assert!(matches!(
            Call::parse("count", vec![json!({"filter": {}})]),
            Err(BridgeError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_parse_rejects_non_object_items() {
        let err = Call::parse("create", vec![json!("users"), json!([1, 2])]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidQuery(_)));
    }

    #[test]
    fn test_args_survive_the_codec() {
        let call = Call::Update {
            table: "users".into(),
            items: vec![json!({"id": 1, "name": "ann"})],
        };
        let parsed = Call::parse(call.method().as_str(), call.clone().into_args()).unwrap();
        assert_eq!(parsed, call);
    }
}
