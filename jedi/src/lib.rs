//! A collection of utilities for dealing with JSON and YAML objects. The sync
//! engine uses these for its configuration tree and for the payloads it hands
//! to event listeners.

#[macro_use]
extern crate quick_error;
#[cfg_attr(test, macro_use)]
extern crate serde_json;

pub use serde_json::Value;
pub use serde_json::Map;
pub use serde::de::DeserializeOwned;
pub use serde::ser::Serialize;

quick_error! {
    #[derive(Debug)]
    pub enum JSONError {
        Boxed(err: Box<dyn std::error::Error + Send + Sync>) {
            display("json: error: {}", err)
        }
        Parse(err: serde_json::Error) {
            source(err)
            display("json: parse error: {}", err)
        }
        Stringify(err: serde_json::Error) {
            source(err)
            display("json: stringify error: {}", err)
        }
        Yaml(err: serde_yaml::Error) {
            source(err)
            display("json: yaml error: {}", err)
        }
        DeadEnd {
            display("json: lookup dead end")
        }
        NotFound(key: String) {
            display("json: key not found: {}", key)
        }
        InvalidKey(key: String) {
            display("json: invalid key for object: {}", key)
        }
    }
}

pub type JResult<T> = Result<T, JSONError>;

impl From<std::io::Error> for JSONError {
    fn from(err: std::io::Error) -> JSONError {
        JSONError::Boxed(Box::new(err))
    }
}

/// Make an empty JSON object
pub fn obj() -> Value {
    Value::Object(Map::new())
}

/// Parse a JSON string into anything deserializable
pub fn parse<T: DeserializeOwned>(string: &str) -> JResult<T> {
    serde_json::from_str(string).map_err(JSONError::Parse)
}

/// Parse a YAML string and return a Value type
pub fn parse_yaml(string: &str) -> JResult<Value> {
    let data: Value = serde_yaml::from_str(string).map_err(JSONError::Yaml)?;
    // an empty yaml document parses as null. we'd rather have an object.
    match data {
        Value::Null => Ok(obj()),
        _ => Ok(data),
    }
}

/// Turn a JSON-serializable object into a Result<String> of JSON.
pub fn stringify<T: Serialize>(obj: &T) -> JResult<String> {
    serde_json::to_string(obj).map_err(JSONError::Stringify)
}

/// Turn a JSON-serializable object into a Result<Value>
pub fn to_val<T: Serialize>(obj: &T) -> JResult<Value> {
    serde_json::to_value(obj).map_err(JSONError::Stringify)
}

/// Turn a JSON Value into a object that implements Deserialize
pub fn from_val<T: DeserializeOwned>(val: Value) -> JResult<T> {
    serde_json::from_value(val).map_err(JSONError::Parse)
}

/// Walk a JSON structure, given a key path. Traverses both objects and arrays,
/// returning a reference to the found value, if any.
pub fn walk<'a>(keys: &[&str], data: &'a Value) -> JResult<&'a Value> {
    let key = match keys.first() {
        Some(x) => *x,
        None => return Ok(data),
    };
    match *data {
        Value::Object(ref obj) => {
            match obj.get(key) {
                Some(d) => walk(&keys[1..], d),
                None => Err(JSONError::NotFound(key.to_owned())),
            }
        }
        Value::Array(ref arr) => {
            let ukey = match key.parse::<usize>() {
                Ok(x) => x,
                Err(..) => return Err(JSONError::InvalidKey(key.to_owned())),
            };
            match arr.get(ukey) {
                Some(d) => walk(&keys[1..], d),
                None => Err(JSONError::NotFound(key.to_owned())),
            }
        }
        _ => Err(JSONError::DeadEnd),
    }
}

/// Same as `walk()` but hands back a mutable reference.
pub fn walk_mut<'a>(keys: &[&str], data: &'a mut Value) -> JResult<&'a mut Value> {
    let key = match keys.first() {
        Some(x) => *x,
        None => return Ok(data),
    };
    match *data {
        Value::Object(ref mut obj) => {
            match obj.get_mut(key) {
                Some(d) => walk_mut(&keys[1..], d),
                None => Err(JSONError::NotFound(key.to_owned())),
            }
        }
        Value::Array(ref mut arr) => {
            let ukey = match key.parse::<usize>() {
                Ok(x) => x,
                Err(..) => return Err(JSONError::InvalidKey(key.to_owned())),
            };
            match arr.get_mut(ukey) {
                Some(d) => walk_mut(&keys[1..], d),
                None => Err(JSONError::NotFound(key.to_owned())),
            }
        }
        _ => Err(JSONError::DeadEnd),
    }
}

/// Like `walk`, except that this returns the raw type instead of a Value.
pub fn get<T: DeserializeOwned>(keys: &[&str], value: &Value) -> JResult<T> {
    let found = walk(keys, value)?;
    serde_json::from_value(found.clone())
        .map_err(|e| JSONError::NotFound(format!("get: {:?}: {}", keys, e)))
}

/// A lot like `get()`, except it converts all errors into a None value. Really
/// nice for quick "does this object have this key path?" one-offs.
pub fn get_opt<T: DeserializeOwned>(keys: &[&str], value: &Value) -> Option<T> {
    get(keys, value).ok()
}

/// Set a field into a mutable JSON Value. Missing intermediate objects are
/// created along the way.
pub fn set<T: Serialize>(keys: &[&str], container: &mut Value, to: &T) -> JResult<()> {
    let (last, butlast) = match keys.split_last() {
        Some(x) => x,
        None => return Err(JSONError::InvalidKey(String::from("set: no keys given"))),
    };
    let mut cur = container;
    for key in butlast {
        if let Value::Null = *cur {
            *cur = obj();
        }
        cur = match cur {
            Value::Object(x) => x.entry(String::from(*key)).or_insert_with(obj),
            Value::Array(x) => {
                let ukey = key.parse::<usize>().map_err(|_| JSONError::InvalidKey(String::from(*key)))?;
                match x.get_mut(ukey) {
                    Some(v) => v,
                    None => return Err(JSONError::NotFound(String::from(*key))),
                }
            }
            _ => return Err(JSONError::DeadEnd),
        };
    }
    match *cur {
        Value::Object(ref mut x) => {
            x.insert(String::from(*last), to_val(to)?);
            Ok(())
        }
        Value::Array(ref mut x) => {
            let ukey = last.parse::<usize>().map_err(|_| JSONError::InvalidKey(String::from(*last)))?;
            match x.get_mut(ukey) {
                Some(slot) => {
                    *slot = to_val(to)?;
                    Ok(())
                }
                None => Err(JSONError::NotFound(String::from(*last))),
            }
        }
        _ => Err(JSONError::DeadEnd),
    }
}

/// Remove a value from a JSON object. Removing something that isn't there is
/// not an error.
pub fn remove(keys: &[&str], container: &mut Value) -> JResult<()> {
    let (last, butlast) = match keys.split_last() {
        Some(x) => x,
        None => return Ok(()),
    };
    match walk_mut(butlast, container) {
        Ok(&mut Value::Object(ref mut x)) => {
            x.remove(*last);
        }
        Ok(&mut Value::Array(ref mut x)) => {
            let idx: usize = last.parse().map_err(|_| JSONError::InvalidKey(String::from(*last)))?;
            if x.len() > idx {
                x.remove(idx);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Recursively merge `from` into `into`. Objects are merged key by key, any
/// other value in `from` replaces what's in `into`.
pub fn merge(into: &mut Value, from: &Value) {
    match (into, from) {
        (&mut Value::Object(ref mut dest), &Value::Object(ref src)) => {
            for (key, val) in src {
                match dest.get_mut(key) {
                    Some(existing) => merge(existing, val),
                    None => {
                        dest.insert(key.clone(), val.clone());
                    }
                }
            }
        }
        (dest, src) => {
            *dest = src.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_parsed() -> Value {
        parse(r#"{"sync":{"max_chunk_entries":50,"enable_incoming":true,"workers":[1,2]},"loglevel":"info"}"#).unwrap()
    }

    #[test]
    fn can_get_value() {
        let data = get_parsed();
        let entries: i32 = get(&["sync", "max_chunk_entries"], &data).unwrap();
        let incoming: bool = get(&["sync", "enable_incoming"], &data).unwrap();
        let worker: u32 = get(&["sync", "workers", "1"], &data).unwrap();
        let level: String = get(&["loglevel"], &data).unwrap();
        assert_eq!(entries, 50);
        assert_eq!(incoming, true);
        assert_eq!(worker, 2);
        assert_eq!(level, "info");

        let missing: Option<String> = get_opt(&["sync", "nope", "nothing"], &data);
        assert_eq!(missing, None);
        let wrong_type: Option<bool> = get_opt(&["loglevel"], &data);
        assert_eq!(wrong_type, None);
    }

    #[test]
    fn sets_nested_paths() {
        let mut data = obj();
        set(&["auth", "expiry_margin_secs"], &mut data, &120).unwrap();
        set(&["loglevel"], &mut data, &"debug").unwrap();
        assert_eq!(stringify(&data).unwrap(), r#"{"auth":{"expiry_margin_secs":120},"loglevel":"debug"}"#);
        assert!(set(&[], &mut data, &1).is_err());
    }

    #[test]
    fn removes_stuff() {
        let mut data = get_parsed();
        remove(&["sync", "workers", "0"], &mut data).unwrap();
        remove(&["sync", "enable_incoming"], &mut data).unwrap();
        remove(&["not", "there"], &mut data).unwrap();
        assert_eq!(stringify(&data).unwrap(), r#"{"loglevel":"info","sync":{"max_chunk_entries":50,"workers":[2]}}"#);
    }

    #[test]
    fn merges_objects() {
        let mut data = get_parsed();
        merge(&mut data, &json!({"sync": {"max_chunk_entries": 10}, "api": {"note_store_url": "mem://primary"}}));
        let entries: i32 = get(&["sync", "max_chunk_entries"], &data).unwrap();
        let incoming: bool = get(&["sync", "enable_incoming"], &data).unwrap();
        let url: String = get(&["api", "note_store_url"], &data).unwrap();
        assert_eq!(entries, 10);
        assert_eq!(incoming, true);
        assert_eq!(url, "mem://primary");
    }

    #[test]
    fn parses_yaml() {
        let data = parse_yaml("sync:\n  interval_ms: 1000\nloglevel: warn\n").unwrap();
        let interval: u64 = get(&["sync", "interval_ms"], &data).unwrap();
        assert_eq!(interval, 1000);
        assert_eq!(parse_yaml("").unwrap(), obj());
    }
}
