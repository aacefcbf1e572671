use crate::protocol::value::OmlValueKind;
use anyhow::{anyhow, bail, Result};

/// Name of the reserved stream-0 schema carrying `(subject, key, value)`
/// metadata tuples.
pub const METADATA_SCHEMA_NAME: &str = "_experiment_metadata";

/// Name of the client self-instrumentation stream.
pub const INSTRUMENTATION_SCHEMA_NAME: &str = "_client_instrumentation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub kind: OmlValueKind,
}

impl SchemaField {
    pub fn new(name: &str, kind: OmlValueKind) -> Self {
        SchemaField {
            name: name.to_string(),
            kind,
        }
    }
}

/// A named, ordered field list together with the stream index assigned by the
/// sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub index: u32,
    pub name: String,
    pub fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new(index: u32, name: &str, fields: Vec<SchemaField>) -> Self {
        Schema {
            index,
            name: name.to_string(),
            fields,
        }
    }

    /// The reserved metadata schema sitting at stream index 0.
    pub fn metadata() -> Schema {
        Schema::new(
            0,
            METADATA_SCHEMA_NAME,
            vec![
                SchemaField::new("subject", OmlValueKind::String),
                SchemaField::new("key", OmlValueKind::String),
                SchemaField::new("value", OmlValueKind::String),
            ],
        )
    }

    /// Parse the payload of a `schema:` header or a stream-0 schema
    /// declaration: `<index> <name> <field>:<type> ...`.
    pub fn from_meta(meta: &str) -> Result<Schema> {
        let mut tokens = meta.split_whitespace();
        let index: u32 = tokens
            .next()
            .ok_or_else(|| anyhow!("empty schema declaration"))?
            .parse()
            .map_err(|_| anyhow!("schema declaration has no index: <{}>", meta))?;
        let name = tokens
            .next()
            .ok_or_else(|| anyhow!("schema declaration has no name: <{}>", meta))?;
        let mut fields = Vec::new();
        for spec in tokens {
            let mut parts = spec.splitn(2, ':');
            let fname = parts.next().unwrap_or_default();
            let tname = parts
                .next()
                .ok_or_else(|| anyhow!("field '{}' has no type in schema <{}>", fname, meta))?;
            let kind = OmlValueKind::from_type_name(tname)
                .ok_or_else(|| anyhow!("unknown field type '{}' in schema <{}>", tname, meta))?;
            fields.push(SchemaField::new(fname, kind));
        }
        if fields.is_empty() {
            bail!("schema '{}' declares no fields", name);
        }
        Ok(Schema::new(index, name, fields))
    }

    /// Emit the declaration in canonical form, suitable for a `schema:`
    /// header line.
    pub fn to_meta(&self) -> String {
        let mut s = format!("{} {}", self.index, self.name);
        for f in &self.fields {
            s.push_str(&format!(" {}:{}", f.name, f.kind.type_name()));
        }
        s
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_emit() {
        let s = Schema::from_meta("1 generator_sin label:string phase:double value:double")
            .unwrap();
        assert_eq!(s.index, 1);
        assert_eq!(s.name, "generator_sin");
        assert_eq!(s.fields.len(), 3);
        assert_eq!(s.fields[1].kind, OmlValueKind::Double);
        assert_eq!(
            s.to_meta(),
            "1 generator_sin label:string phase:double value:double"
        );
    }

    #[test]
    fn legacy_types_are_canonicalised() {
        let s = Schema::from_meta("2 generator_lin label:string counter:long").unwrap();
        assert_eq!(s.fields[1].kind, OmlValueKind::Int32);
        assert_eq!(s.to_meta(), "2 generator_lin label:string counter:int32");
    }

    #[test]
    fn rejects_malformed_declarations() {
        assert!(Schema::from_meta("").is_err());
        assert!(Schema::from_meta("x name a:int32").is_err());
        assert!(Schema::from_meta("1 name").is_err());
        assert!(Schema::from_meta("1 name field").is_err());
        assert!(Schema::from_meta("1 name field:nosuchtype").is_err());
    }

    #[test]
    fn metadata_schema_shape() {
        let s = Schema::metadata();
        assert_eq!(s.index, 0);
        assert_eq!(s.fields.len(), 3);
        assert!(s.fields.iter().all(|f| f.kind == OmlValueKind::String));
        assert_eq!(s.field_index("key"), Some(1));
    }
}
