//! Writer Configuration
//!
//! Writers are configured through a flat map of named options, usually taken
//! from the job definition. `WriterSpec::parse` turns the map into the typed
//! form and rejects anything missing, mistyped, unknown or conflicting.
//!
//! ```toml
//! bucket_name = "results"
//! tmp_bucket_name = "scratch"
//! naming_format = "$name/$id/part-$num"
//! no_duplicate = true
//! ```

use super::error::{OutputError, Result};
use super::object_store::CreateOptions;
use super::pool::{PoolConfig, MAX_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat option map as supplied by the job
pub type WriterOptions = Map<String, Value>;

pub const BUCKET_NAME: &str = "bucket_name";
pub const TMP_BUCKET_NAME: &str = "tmp_bucket_name";
pub const NAMING_FORMAT: &str = "naming_format";
pub const CONTENT_TYPE: &str = "content_type";
pub const ACL: &str = "acl";
pub const NO_DUPLICATE: &str = "no_duplicate";
pub const OUTPUT_SHARDING: &str = "output_sharding";
pub const BUFFERED: &str = "buffered";
pub const FLUSH_SIZE: &str = "flush_size";

const KNOWN_OPTIONS: &[&str] = &[
    BUCKET_NAME,
    TMP_BUCKET_NAME,
    NAMING_FORMAT,
    CONTENT_TYPE,
    ACL,
    NO_DUPLICATE,
    OUTPUT_SHARDING,
    BUFFERED,
    FLUSH_SIZE,
];

pub const DEFAULT_NAMING_FORMAT: &str = "$name/$id/output-$num";

/// Namespace for temporary objects inside a bucket
pub const MR_TMP: &str = "mr_tmp";
pub const SEGMENT_NAMING_FORMAT: &str = "mr_tmp/$name/$id/attempt-$attempt/output-$num/seg-$seg";
const STAGING_PREFIX_FORMAT: &str = "mr_tmp/$id-tmp-$num-";

/// Whether shards write their own objects or share one job-wide object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputSharding {
    /// One job-wide object appended to by every shard
    #[serde(rename = "none")]
    Shared,
    /// One object per input shard
    #[serde(rename = "input")]
    PerShard,
}

/// Which options a writer kind accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionRules {
    pub allow_output_sharding: bool,
    pub allow_no_duplicate: bool,
}

impl OptionRules {
    pub const SIMPLE: OptionRules = OptionRules {
        allow_output_sharding: true,
        allow_no_duplicate: true,
    };
    pub const CONSISTENT: OptionRules = OptionRules {
        allow_output_sharding: false,
        allow_no_duplicate: false,
    };
}

/// Validated writer configuration; travels inside checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterSpec {
    pub bucket_name: String,
    pub tmp_bucket_name: Option<String>,
    pub naming_format: String,
    pub content_type: Option<String>,
    pub acl: Option<String>,
    pub no_duplicate: bool,
    pub output_sharding: OutputSharding,
    pub buffered: bool,
    pub pool: PoolConfig,
}

impl WriterSpec {
    /// Spec with defaults for everything but the bucket (for tests)
    pub fn test(bucket_name: &str) -> Self {
        WriterSpec {
            bucket_name: bucket_name.to_string(),
            tmp_bucket_name: None,
            naming_format: DEFAULT_NAMING_FORMAT.to_string(),
            content_type: None,
            acl: None,
            no_duplicate: false,
            output_sharding: OutputSharding::PerShard,
            buffered: false,
            pool: PoolConfig::default(),
        }
    }

    pub fn parse(options: &WriterOptions, rules: OptionRules) -> Result<Self> {
        if let Some(unknown) = options
            .keys()
            .find(|k| !KNOWN_OPTIONS.contains(&k.as_str()))
        {
            return Err(OutputError::Config(format!("unknown option '{}'", unknown)));
        }

        let bucket_name = opt_string(options, BUCKET_NAME)?.ok_or_else(|| {
            OutputError::Config(format!("{} is required", BUCKET_NAME))
        })?;
        validate_bucket_name(&bucket_name)?;

        let tmp_bucket_name = opt_string(options, TMP_BUCKET_NAME)?;
        if let Some(tmp) = &tmp_bucket_name {
            validate_bucket_name(tmp)?;
        }

        let output_sharding = match opt_string(options, OUTPUT_SHARDING)? {
            None => OutputSharding::PerShard,
            Some(_) if !rules.allow_output_sharding => {
                return Err(OutputError::Config(format!(
                    "{} is not supported by this writer",
                    OUTPUT_SHARDING
                )));
            }
            Some(v) if v == "none" => OutputSharding::Shared,
            Some(v) if v == "input" => OutputSharding::PerShard,
            Some(v) => {
                return Err(OutputError::Config(format!(
                    "{} must be 'none' or 'input', got '{}'",
                    OUTPUT_SHARDING, v
                )));
            }
        };

        let no_duplicate = opt_bool(options, NO_DUPLICATE)?.unwrap_or(false);
        if no_duplicate && !rules.allow_no_duplicate {
            return Err(OutputError::Config(format!(
                "{} is not supported by this writer",
                NO_DUPLICATE
            )));
        }
        if no_duplicate && output_sharding == OutputSharding::Shared {
            return Err(OutputError::Config(format!(
                "{} conflicts with {} = none",
                NO_DUPLICATE, OUTPUT_SHARDING
            )));
        }

        let mut pool = PoolConfig::default();
        if let Some(flush_size) = opt_usize(options, FLUSH_SIZE)? {
            pool = PoolConfig {
                flush_size,
                max_size: MAX_SIZE,
            };
        }
        pool.validate()?;

        let spec = WriterSpec {
            bucket_name,
            tmp_bucket_name,
            naming_format: opt_string(options, NAMING_FORMAT)?
                .unwrap_or_else(|| DEFAULT_NAMING_FORMAT.to_string()),
            content_type: opt_string(options, CONTENT_TYPE)?,
            acl: opt_string(options, ACL)?,
            no_duplicate,
            output_sharding,
            buffered: opt_bool(options, BUFFERED)?.unwrap_or(false),
            pool,
        };

        // Both templates must render with sample values
        spec.output_name("name", "id", 0)?;
        spec.segment_name("name", "id", 0, 1, 0)?;
        Ok(spec)
    }

    /// Load an option map from a TOML table
    pub fn options_from_toml(text: &str) -> Result<WriterOptions> {
        let table: toml::Table = toml::from_str(text)
            .map_err(|e| OutputError::Config(format!("bad TOML options: {}", e)))?;
        match serde_json::to_value(table) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(OutputError::Config("options must be a table".into())),
            Err(e) => Err(OutputError::Config(e.to_string())),
        }
    }

    pub fn tmp_bucket(&self) -> &str {
        self.tmp_bucket_name.as_deref().unwrap_or(&self.bucket_name)
    }

    pub fn create_options(&self) -> CreateOptions {
        CreateOptions {
            content_type: self.content_type.clone(),
            acl: self.acl.clone(),
            metadata: Default::default(),
        }
    }

    /// Final object name of a shard's output
    pub fn output_name(&self, job_name: &str, job_id: &str, shard: u32) -> Result<String> {
        let key = render_template(
            &self.naming_format,
            &[("name", job_name), ("id", job_id), ("num", &shard.to_string())],
        )?;
        Ok(format!("/{}/{}", self.bucket_name, key))
    }

    /// Name of one duplicate-avoiding segment
    pub fn segment_name(
        &self,
        job_name: &str,
        job_id: &str,
        shard: u32,
        attempt: u32,
        seg: u32,
    ) -> Result<String> {
        let key = render_template(
            SEGMENT_NAMING_FORMAT,
            &[
                ("name", job_name),
                ("id", job_id),
                ("num", &shard.to_string()),
                ("attempt", &attempt.to_string()),
                ("seg", &seg.to_string()),
            ],
        )?;
        Ok(format!("/{}/{}", self.bucket_name, key))
    }

    /// Common prefix of every staging object of one shard
    pub fn staging_prefix(&self, job_id: &str, shard: u32) -> Result<String> {
        let key = render_template(
            STAGING_PREFIX_FORMAT,
            &[("id", job_id), ("num", &shard.to_string())],
        )?;
        Ok(format!("/{}/{}", self.tmp_bucket(), key))
    }

    /// Job-wide object used when shards share output
    pub fn shared_name(&self, job_name: &str, job_id: &str) -> String {
        format!("/{}/{}-{}-output", self.bucket_name, job_name, job_id)
    }
}

fn opt_string(options: &WriterOptions, key: &str) -> Result<Option<String>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(OutputError::Config(format!(
            "{} must be a string, got {}",
            key, other
        ))),
    }
}

fn opt_bool(options: &WriterOptions, key: &str) -> Result<Option<bool>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(OutputError::Config(format!(
            "{} must be a boolean, got {}",
            key, other
        ))),
    }
}

fn opt_usize(options: &WriterOptions, key: &str) -> Result<Option<usize>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| {
                OutputError::Config(format!("{} must be a non-negative integer", key))
            }),
        Some(other) => Err(OutputError::Config(format!(
            "{} must be an integer, got {}",
            key, other
        ))),
    }
}

/// 3 to 63 characters of `[a-z0-9._-]`, starting and ending alphanumeric
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let bad = |why: &str| Err(OutputError::Config(format!("bad bucket name '{}': {}", name, why)));

    if name.len() < 3 || name.len() > 63 {
        return bad("length must be between 3 and 63");
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'_'))
    {
        return bad("only lowercase letters, digits, '.', '-' and '_' are allowed");
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = name.as_bytes();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return bad("must start and end with a letter or digit");
    }
    Ok(())
}

/// Substitute `$var` and `${var}` placeholders; `$$` is a literal dollar.
/// Unknown or malformed placeholders are configuration errors.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let lookup = |key: &str| {
        vars.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .ok_or_else(|| {
                OutputError::Config(format!(
                    "naming template '{}' has unknown placeholder '{}'",
                    template, key
                ))
            })
    };
    let malformed = |at: usize| {
        OutputError::Config(format!(
            "naming template '{}' is malformed at byte {}",
            template, at
        ))
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let at = template.len() - rest.len() + idx;
        let after = &rest[idx + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(braced) = after.strip_prefix('{') {
            let close = braced.find('}').ok_or_else(|| malformed(at))?;
            let key = &braced[..close];
            if !is_identifier(key) {
                return Err(malformed(at));
            }
            out.push_str(lookup(key)?);
            rest = &braced[close + 1..];
        } else {
            let len = after
                .char_indices()
                .find(|&(i, c)| !(c == '_' || c.is_ascii_alphanumeric()) || (i == 0 && c.is_ascii_digit()))
                .map(|(i, _)| i)
                .unwrap_or(after.len());
            if len == 0 {
                return Err(malformed(at));
            }
            out.push_str(lookup(&after[..len])?);
            rest = &after[len..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: Value) -> WriterOptions {
        match value {
            Value::Object(map) => map,
            _ => panic!("options must be an object"),
        }
    }

    #[test]
    fn test_parse_defaults() {
        let spec = WriterSpec::parse(&options(json!({"bucket_name": "out"})), OptionRules::SIMPLE)
            .unwrap();
        assert_eq!(spec, WriterSpec::test("out"));
        assert_eq!(spec.tmp_bucket(), "out");
    }

    #[test]
    fn test_parse_full() {
        let spec = WriterSpec::parse(
            &options(json!({
                "bucket_name": "out",
                "tmp_bucket_name": "scratch",
                "naming_format": "${name}/part-$num",
                "content_type": "text/plain",
                "acl": "project-private",
                "no_duplicate": true,
                "buffered": true,
                "flush_size": 4096,
            })),
            OptionRules::SIMPLE,
        )
        .unwrap();
        assert_eq!(spec.tmp_bucket(), "scratch");
        assert!(spec.no_duplicate);
        assert!(spec.buffered);
        assert_eq!(spec.pool.flush_size, 4096);
        assert_eq!(spec.output_name("job", "42", 3).unwrap(), "/out/job/part-3");
        assert_eq!(spec.create_options().acl.as_deref(), Some("project-private"));
    }

    #[test]
    fn test_missing_bucket() {
        let err = WriterSpec::parse(&options(json!({})), OptionRules::SIMPLE).unwrap_err();
        assert!(matches!(err, OutputError::Config(msg) if msg.contains("bucket_name")));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = WriterSpec::parse(
            &options(json!({"bucket_name": "out", "mime_type": "x"})),
            OptionRules::SIMPLE,
        )
        .unwrap_err();
        assert!(matches!(err, OutputError::Config(msg) if msg.contains("mime_type")));
    }

    #[test]
    fn test_mistyped_options_rejected() {
        for bad in [
            json!({"bucket_name": 7}),
            json!({"bucket_name": "out", "no_duplicate": "yes"}),
            json!({"bucket_name": "out", "flush_size": -1}),
            json!({"bucket_name": "out", "output_sharding": "sideways"}),
        ] {
            assert!(WriterSpec::parse(&options(bad), OptionRules::SIMPLE).is_err());
        }
    }

    #[test]
    fn test_sharding_rules() {
        let shared = options(json!({"bucket_name": "out", "output_sharding": "none"}));
        let spec = WriterSpec::parse(&shared, OptionRules::SIMPLE).unwrap();
        assert_eq!(spec.output_sharding, OutputSharding::Shared);

        assert!(WriterSpec::parse(&shared, OptionRules::CONSISTENT).is_err());

        let conflicting = options(json!({
            "bucket_name": "out",
            "output_sharding": "none",
            "no_duplicate": true,
        }));
        assert!(WriterSpec::parse(&conflicting, OptionRules::SIMPLE).is_err());
    }

    #[test]
    fn test_flush_size_above_max_rejected() {
        let opts = options(json!({"bucket_name": "out", "flush_size": MAX_SIZE + 1}));
        assert!(WriterSpec::parse(&opts, OptionRules::SIMPLE).is_err());
    }

    #[test]
    fn test_bucket_name_validation() {
        assert!(validate_bucket_name("my-bucket.v2").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("Upper").is_err());
        assert!(validate_bucket_name("-lead").is_err());
        assert!(validate_bucket_name("trail_").is_err());
        assert!(validate_bucket_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_bad_naming_template() {
        let opts = options(json!({"bucket_name": "out", "naming_format": "$name/$shard"}));
        let err = WriterSpec::parse(&opts, OptionRules::SIMPLE).unwrap_err();
        assert!(matches!(err, OutputError::Config(msg) if msg.contains("shard")));

        let opts = options(json!({"bucket_name": "out", "naming_format": "${name"}));
        assert!(WriterSpec::parse(&opts, OptionRules::SIMPLE).is_err());
    }

    #[test]
    fn test_render_template() {
        let vars = [("name", "job"), ("num", "3")];
        assert_eq!(render_template("$name-$num", &vars).unwrap(), "job-3");
        assert_eq!(render_template("${name}x", &vars).unwrap(), "jobx");
        assert_eq!(render_template("cost$$", &vars).unwrap(), "cost$");
        assert!(render_template("$", &vars).is_err());
        assert!(render_template("$1", &vars).is_err());
    }

    #[test]
    fn test_layout_names() {
        let mut spec = WriterSpec::test("out");
        assert_eq!(spec.output_name("job", "7", 2).unwrap(), "/out/job/7/output-2");
        assert_eq!(
            spec.segment_name("job", "7", 2, 1, 0).unwrap(),
            "/out/mr_tmp/job/7/attempt-1/output-2/seg-0"
        );
        assert_eq!(spec.shared_name("job", "7"), "/out/job-7-output");

        spec.tmp_bucket_name = Some("scratch".into());
        assert_eq!(spec.staging_prefix("7", 2).unwrap(), "/scratch/mr_tmp/7-tmp-2-");
    }

    #[test]
    fn test_options_from_toml() {
        let opts = WriterSpec::options_from_toml(
            "bucket_name = \"out\"\nno_duplicate = true\nflush_size = 1024\n",
        )
        .unwrap();
        let spec = WriterSpec::parse(&opts, OptionRules::SIMPLE).unwrap();
        assert!(spec.no_duplicate);
        assert_eq!(spec.pool.flush_size, 1024);
    }
}
