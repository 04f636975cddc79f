use std::collections::HashMap;
use std::net::IpAddr;

use byte_unit::Byte;
use clap::Parser;

use crate::backend::ChannelId;
use crate::location::DcId;
use crate::s3::{DcEndpoint, S3Options};

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_CHUNK: &str = "1MiB";
const DEFAULT_HOME_DC: DcId = 1;
const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Byte-range HTTP streaming for media held in a chunked remote store.
#[derive(Debug, Clone, Parser)]
#[command(name = "streamgate", version, about, long_about = None)]
pub struct CliArgs {
    /// IP address to bind on. Omit to bind all interfaces.
    #[arg(long, env = "SG_BIND_IP", help = "Bind IP address [default: 0.0.0.0]")]
    pub bind_ip: Option<IpAddr>,

    /// TCP port to listen on.
    #[arg(long, env = "SG_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Public base URL used when building share and download links.
    #[arg(long, env = "SG_BASE_URL")]
    pub base_url: String,

    /// Channel holding the stored media messages.
    #[arg(long, env = "SG_STORAGE_CHANNEL", allow_hyphen_values = true)]
    pub storage_channel: ChannelId,

    /// Backend fetch size, e.g. 1MiB. Every fetch is aligned to it.
    #[arg(
        long,
        env = "SG_CHUNK_SIZE",
        default_value = DEFAULT_CHUNK,
        value_parser = parse_byte_size
    )]
    pub chunk_size: u64,

    /// Bucket of the home datacenter; also holds messages and links.
    #[arg(long, env = "SG_BUCKET")]
    pub bucket: String,

    /// AWS region of the home datacenter. Falls back to SDK default resolution.
    #[arg(long, env = "SG_REGION")]
    pub region: Option<String>,

    /// Datacenter id of the home bucket.
    #[arg(long, env = "SG_HOME_DC", default_value_t = DEFAULT_HOME_DC)]
    pub home_dc: DcId,

    /// Foreign datacenter as DC=REGION:BUCKET. Repeatable.
    #[arg(
        long = "datacenter",
        env = "SG_DATACENTERS",
        value_delimiter = ',',
        value_parser = parse_datacenter
    )]
    pub datacenters: Vec<DatacenterArg>,

    /// Extra AWS profiles, one additional pool session each.
    #[arg(long, env = "SG_SESSION_PROFILES", value_delimiter = ',')]
    pub session_profiles: Vec<String>,

    /// Override S3 endpoint URL (for LocalStack or S3-compatible services).
    #[arg(long, env = "SG_S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    /// Force path-style S3 addressing (required for LocalStack).
    #[arg(long, env = "SG_S3_FORCE_PATH_STYLE", default_value_t = false)]
    pub s3_force_path_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatacenterArg {
    pub id: DcId,
    pub endpoint: DcEndpoint,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub base_url: String,
    pub storage_channel: ChannelId,
    pub chunk_size: u64,
    pub bucket: String,
    pub region: Option<String>,
    pub home_dc: DcId,
    pub datacenters: HashMap<DcId, DcEndpoint>,
    pub session_profiles: Vec<String>,
    pub s3: S3Options,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        anyhow::ensure!(
            args.chunk_size > 0 && args.chunk_size <= MAX_CHUNK_SIZE,
            "chunk-size must be in 1B..=64MiB"
        );
        let base_url = args.base_url.trim_end_matches('/').to_string();
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "base-url must be an http(s) URL"
        );
        anyhow::ensure!(!args.bucket.is_empty(), "bucket must not be empty");
        anyhow::ensure!(
            args.session_profiles.iter().all(|p| !p.trim().is_empty()),
            "session profile names must not be empty"
        );

        let mut datacenters = HashMap::new();
        for dc in args.datacenters {
            anyhow::ensure!(
                dc.id != args.home_dc,
                "datacenter {} is the home datacenter; use --bucket/--region",
                dc.id
            );
            anyhow::ensure!(
                datacenters.insert(dc.id, dc.endpoint).is_none(),
                "datacenter {} configured twice",
                dc.id
            );
        }

        Ok(Self {
            bind_ip: args.bind_ip.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0])),
            port: args.port,
            base_url,
            storage_channel: args.storage_channel,
            chunk_size: args.chunk_size,
            bucket: args.bucket,
            region: args.region,
            home_dc: args.home_dc,
            datacenters,
            session_profiles: args
                .session_profiles
                .into_iter()
                .map(|p| p.trim().to_string())
                .collect(),
            s3: S3Options {
                endpoint_url: args.s3_endpoint_url,
                force_path_style: args.s3_force_path_style,
            },
        })
    }
}

fn parse_byte_size(input: &str) -> Result<u64, String> {
    Byte::parse_str(input, true)
        .map(|b| b.as_u64())
        .map_err(|e| format!("invalid byte size: {e}"))
}

fn parse_datacenter(input: &str) -> Result<DatacenterArg, String> {
    let (id, rest) = input
        .trim()
        .split_once('=')
        .ok_or_else(|| format!("expected DC=REGION:BUCKET, got {input:?}"))?;
    let id: DcId = id
        .trim()
        .parse()
        .map_err(|e| format!("invalid datacenter id {id:?}: {e}"))?;
    let (region, bucket) = rest
        .split_once(':')
        .ok_or_else(|| format!("expected REGION:BUCKET after '=', got {rest:?}"))?;
    let (region, bucket) = (region.trim(), bucket.trim());
    if region.is_empty() || bucket.is_empty() {
        return Err(format!("region and bucket must be set in {input:?}"));
    }
    Ok(DatacenterArg {
        id,
        endpoint: DcEndpoint {
            region: region.to_string(),
            bucket: bucket.to_string(),
        },
    })
}
