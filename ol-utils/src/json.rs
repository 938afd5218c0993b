use anyhow::{anyhow, Result};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{to_string, to_value, Map, Value};
use std::{
    fs,
    io::{Read, Write},
    path::Path,
};

/// Serializes with object keys sorted so that identical objects always
/// produce identical bytes.
pub fn jsonify<T>(obj: &T) -> Result<String>
where
    T: Serialize,
{
    Ok(to_string(&jsonify_internal(&to_value(obj)?))?)
}

pub fn jsonify_internal(json_value: &Value) -> Value {
    match json_value {
        Value::Object(obj) => {
            let mut sorted_map = Map::new();
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            for key in keys {
                if let Some(value) = obj.get(key) {
                    sorted_map.insert(key.clone(), jsonify_internal(value));
                }
            }
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(jsonify_internal).collect()),
        _ => json_value.clone(),
    }
}

pub fn decompress_obj<T>(input: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    let mut decoder = ZlibDecoder::new(input);
    let mut decompressed = String::new();
    decoder.read_to_string(&mut decompressed)?;
    Ok(serde_json::from_str::<T>(&decompressed)?)
}

pub fn compress_obj<T>(input: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(jsonify(input)?.as_bytes())?;
    Ok(encoder.finish()?)
}

/// Accepts either an inline json string or a path ending in `.json`.
pub fn load_json_or_path<T>(input: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let json = if input.ends_with(".json") {
        fs::read_to_string(input).map_err(|e| anyhow!("Failed to read '{}': {}", input, e))?
    } else {
        input.to_string()
    };
    serde_json::from_str::<T>(&json).map_err(|e| anyhow!("Failed to parse json: {}", e))
}

/// Writes `obj` to `path`, zlib-compressed when `compress` is set.
pub fn write_obj<T>(path: &Path, obj: &T, compress: bool) -> Result<()>
where
    T: Serialize,
{
    let bytes = if compress {
        compress_obj(obj)?
    } else {
        jsonify(obj)?.into_bytes()
    };
    fs::write(path, bytes).map_err(|e| anyhow!("Failed to write '{}': {}", path.display(), e))
}

/// Reads an object written by `write_obj`, detecting compression from the
/// zlib header byte.
pub fn read_obj<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let bytes =
        fs::read(path).map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
    match bytes.first() {
        Some(0x78) => decompress_obj(&bytes),
        _ => Ok(serde_json::from_slice::<T>(&bytes)?),
    }
}
