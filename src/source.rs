// batch_ingestor/src/source.rs
// Reads JSON-lines files into object items for the CLI loader.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::error::{BatchError, Result};
use crate::item::ObjectItem;

const EXTENSIONS: [&str; 3] = ["jsonl", "ndjson", "json",];

/// Keys with special meaning on a line. Everything else becomes a property.
const ID_KEY: &str = "id";
const VECTOR_KEY: &str = "vector";
const VECTORS_KEY: &str = "vectors";
const TENANT_KEY: &str = "tenant";

/// Lists the input files under `path`, sorted for a stable load order.
pub fn collect_files(path: &Path,) -> Result<Vec<PathBuf,>,> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()],);
    }
    if !path.is_dir() {
        return Err(BatchError::Configuration(format!(
            "Input path '{}' does not exist",
            path.display()
        ),),);
    }

    let mut files: Vec<PathBuf,> = walkdir::WalkDir::new(path,)
        .into_iter()
        .filter_map(|e| e.ok(),)
        .filter(|e| e.file_type().is_file(),)
        .map(|e| e.into_path(),)
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str(),)
                .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str(),),)
                .unwrap_or(false,)
        },)
        .collect();
    files.sort();
    Ok(files,)
}

fn parse_vector(value: &Value, what: &str,) -> Result<Vec<f32,>,> {
    let arr = value
        .as_array()
        .ok_or_else(|| BatchError::Validation(format!("{} must be an array of numbers", what),),)?;
    arr.iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32,)
                .ok_or_else(|| BatchError::Validation(format!("{} contains a non-number", what),),)
        },)
        .collect()
}

/// Turns one JSON line into an object for `collection`.
pub fn parse_object_line(line: &str, collection: &str, tenant: Option<&str,>,) -> Result<ObjectItem,> {
    let value: Value = serde_json::from_str(line,)
        .map_err(|e| BatchError::Validation(format!("invalid JSON: {}", e),),)?;
    let Value::Object(mut fields,) = value else {
        return Err(BatchError::Validation("each line must be a JSON object".to_string(),),);
    };

    let id = fields.remove(ID_KEY,);
    let vector = fields.remove(VECTOR_KEY,);
    let vectors = fields.remove(VECTORS_KEY,);
    let line_tenant = fields.remove(TENANT_KEY,);

    let mut item = ObjectItem::new(collection, Value::Object(fields,),)?;

    match id {
        Some(Value::String(id,),) => item = item.with_id_str(&id,)?,
        Some(Value::Null,) | None => {},
        Some(other,) => {
            return Err(BatchError::Validation(format!("id must be a string, got {}", other),),);
        },
    }
    if let Some(v,) = vector.filter(|v| !v.is_null(),) {
        item = item.with_vector(parse_vector(&v, "vector",)?,)?;
    }
    if let Some(Value::Object(named,),) = vectors {
        for (name, v,) in named {
            item = item.with_named_vector(&name, parse_vector(&v, &format!("vector '{}'", name),)?,)?;
        }
    }

    let tenant = match line_tenant {
        Some(Value::String(t,),) => Some(t,),
        _ => tenant.map(str::to_string,),
    };
    if let Some(t,) = tenant {
        item = item.with_tenant(t,)?;
    }
    Ok(item,)
}

/// A line that could not be turned into an item.
#[derive(Debug,)]
pub struct LineError {
    pub line:  usize,
    pub error: BatchError,
}

/// Streams object items out of a JSON-lines file, one line at a time.
pub struct ObjectReader {
    lines:      Lines<BufReader<File,>,>,
    collection: String,
    tenant:     Option<String,>,
    line:       usize,
}

impl ObjectReader {
    pub async fn open(path: &Path, collection: &str, tenant: Option<&str,>,) -> Result<Self,> {
        let file = File::open(path,).await?;
        Ok(Self {
            lines:      BufReader::new(file,).lines(),
            collection: collection.to_string(),
            tenant:     tenant.map(str::to_string,),
            line:       0,
        },)
    }

    /// Next non-blank line, parsed. A bad line is returned as a `LineError` so the caller can
    /// keep going; `Ok(None)` means end of file.
    pub async fn next_item(&mut self,) -> Result<Option<std::result::Result<ObjectItem, LineError,>,>,> {
        while let Some(line,) = self.lines.next_line().await? {
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = parse_object_line(&line, &self.collection, self.tenant.as_deref(),)
                .map_err(|error| LineError {
                    line: self.line,
                    error,
                },);
            return Ok(Some(parsed,),);
        }
        Ok(None,)
    }

    /// Number of the line last read, 1-based.
    pub fn line(&self,) -> usize {
        self.line
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn reserved_keys_are_lifted_out() {
        let line = r#"{"id":"8f14e45f-ceea-467a-9575-3d4c3f4a7b11","vector":[1,2],"title":"t","tenant":"x"}"#;
        let item = parse_object_line(line, "doc", None).unwrap();
        let wire = item.to_wire();
        assert_eq!(wire["class"], "Doc");
        assert_eq!(wire["properties"], json!({ "title": "t" }));
        assert_eq!(wire["vector"], json!([1.0, 2.0]));
        assert_eq!(wire["tenant"], "x");
    }

    #[test]
    fn default_tenant_and_named_vectors() {
        let item =
            parse_object_line(r#"{"vectors":{"body":[0.5]},"n":1}"#, "doc", Some("t1")).unwrap();
        let wire = item.to_wire();
        assert_eq!(wire["tenant"], "t1");
        assert_eq!(wire["vectors"]["body"], json!([0.5]));
    }

    #[test]
    fn bad_lines_are_rejected() {
        assert!(parse_object_line("[1]", "doc", None).is_err());
        assert!(parse_object_line("{", "doc", None).is_err());
        assert!(parse_object_line(r#"{"id":"nope"}"#, "doc", None).is_err());
        assert!(parse_object_line(r#"{"vector":["a"]}"#, "doc", None).is_err());
    }

    #[tokio::test]
    async fn reads_directory_of_jsonl() {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join("b.jsonl")).unwrap();
        writeln!(f, "{{\"n\":1}}").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "not json").unwrap();
        writeln!(f, "{{\"n\":2}}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let files = collect_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);

        let mut reader = ObjectReader::open(&files[0], "doc", None).await.unwrap();
        let first = reader.next_item().await.unwrap().unwrap().unwrap();
        assert_eq!(first.properties()["n"], 1);
        assert_eq!(reader.line(), 1);

        let bad = reader.next_item().await.unwrap().unwrap().unwrap_err();
        assert_eq!(bad.line, 3);

        let last = reader.next_item().await.unwrap().unwrap().unwrap();
        assert_eq!(last.properties()["n"], 2);
        assert!(reader.next_item().await.unwrap().is_none());
    }
}
