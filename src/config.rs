use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};
use uuid::Uuid;

const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 3600;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub metadata_table: String,
    pub storage: StorageConfig,
    /// `None` disables event publishing.
    pub pubsub: Option<PubSubConfig>,
    pub presign_expiry: Duration,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    S3(S3Config),
    Local(LocalStorageConfig),
}

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub public_read: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

#[derive(Clone)]
pub struct LocalStorageConfig {
    pub storage_dir: String,
    pub public_base_url: String,
    pub signing_secret: String,
}

#[derive(Clone)]
pub struct PubSubConfig {
    pub topic: String,
    pub project_id: Option<String>,
    pub emulator_host: Option<String>,
    /// Bearer token for the emulator. Google Cloud itself is reached with
    /// Application Default Credentials.
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Local,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "local" | "disk" => Ok(Self::Local),
            other => Err(format!("unknown storage backend `{}` (expected s3 or local)", other)),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File upload service over object storage")]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Metadata database URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object storage backend: s3 or local (overrides STORAGE_BACKEND)
    #[arg(long)]
    pub storage_backend: Option<StorageBackend>,

    /// Directory for the local backend (overrides STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Create the metadata schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse `.env`, environment variables and CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let _ = dotenvy::dotenv();
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values produced by `lookup` (normally the environment).
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = args
            .host
            .or_else(|| var("HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&var, "PORT")?.unwrap_or(3000),
        };
        let database_url = args
            .database_url
            .or_else(|| var("DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/uploads.db".into());
        let metadata_table = var("METADATA_TABLE").unwrap_or_else(|| "s3_image_info".into());

        let bucket = var("BUCKET_NAME");
        let backend = match args.storage_backend {
            Some(backend) => backend,
            None => match var("STORAGE_BACKEND") {
                Some(value) => value
                    .parse::<StorageBackend>()
                    .map_err(anyhow::Error::msg)
                    .context("parsing STORAGE_BACKEND")?,
                None if bucket.is_some() => StorageBackend::S3,
                None => StorageBackend::Local,
            },
        };

        let storage = match backend {
            StorageBackend::S3 => {
                let Some(bucket) = bucket else {
                    bail!("BUCKET_NAME must be set when using the s3 storage backend");
                };
                StorageConfig::S3(S3Config {
                    bucket,
                    region: var("AWS_REGION")
                        .or_else(|| var("AWS_DEFAULT_REGION"))
                        .unwrap_or_else(|| "us-east-1".into()),
                    endpoint_url: var("S3_ENDPOINT_URL"),
                    force_path_style: parse_bool(&var, "S3_FORCE_PATH_STYLE")?.unwrap_or(false),
                    public_read: parse_bool(&var, "S3_PUBLIC_READ")?.unwrap_or(false),
                    access_key_id: var("AWS_ACCESS_KEY_ID"),
                    secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
                    session_token: var("AWS_SESSION_TOKEN"),
                })
            }
            StorageBackend::Local => StorageConfig::Local(LocalStorageConfig {
                storage_dir: args
                    .storage_dir
                    .or_else(|| var("STORAGE_DIR"))
                    .unwrap_or_else(|| "./data/objects".into()),
                public_base_url: var("PUBLIC_BASE_URL")
                    .unwrap_or_else(|| format!("http://localhost:{}", port)),
                signing_secret: var("LOCAL_SIGNING_SECRET")
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            }),
        };

        let pubsub = var("PUBSUB_TOPIC_NAME").map(|topic| PubSubConfig {
            topic,
            project_id: var("PUBSUB_PROJECT_ID").or_else(|| var("GOOGLE_CLOUD_PROJECT")),
            emulator_host: var("PUBSUB_EMULATOR_HOST"),
            access_token: var("PUBSUB_ACCESS_TOKEN"),
        });

        let presign_secs: u64 =
            parse_var(&var, "PRESIGNED_URL_EXPIRY_SECS")?.unwrap_or(DEFAULT_PRESIGN_EXPIRY_SECS);
        if presign_secs == 0 {
            bail!("PRESIGNED_URL_EXPIRY_SECS must be greater than zero");
        }

        Ok(Self {
            host,
            port,
            database_url,
            metadata_table,
            storage,
            pubsub,
            presign_expiry: Duration::from_secs(presign_secs),
            max_upload_bytes: parse_var(&var, "MAX_UPLOAD_BYTES")?
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", name, value))
        })
        .transpose()
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>> {
    var(name)
        .map(|value| -> Result<bool> {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("parsing {} value `{}`: expected a boolean", name, value),
            }
        })
        .transpose()
}

const REDACTED: &str = "<redacted>";

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| REDACTED)
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("force_path_style", &self.force_path_style)
            .field("public_read", &self.public_read)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("session_token", &redact(&self.session_token))
            .finish()
    }
}

impl fmt::Debug for LocalStorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStorageConfig")
            .field("storage_dir", &self.storage_dir)
            .field("public_base_url", &self.public_base_url)
            .field("signing_secret", &REDACTED)
            .finish()
    }
}

impl fmt::Debug for PubSubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubConfig")
            .field("topic", &self.topic)
            .field("project_id", &self.project_id)
            .field("emulator_host", &self.emulator_host)
            .field("access_token", &redact(&self.access_token))
            .finish()
    }
}
