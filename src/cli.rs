//! CLI argument definitions via clap derive.

use std::fmt;
use std::path::PathBuf;

use clap::Parser;

use crate::auth::{ClientCredentials, LocalServerReceiver, ACCESS_TOKEN_URL};
use crate::genomics::DEFAULT_API_ROOT;
use crate::pipeline::Query;

/// The 1000 Genomes dataset.
pub const DEFAULT_DATASET_ID: &str = "10473108253681171589";

/// Getting started with the genomics API: sign in with OAuth2, then print the
/// bases a sample's reads carry at one position and the genotype called there.
#[derive(Parser)]
#[command(name = "genomics-quickstart", version)]
pub struct Args {
    /// A "Client ID for native application" that has the Genomics API enabled.
    #[arg(env = "GENOMICS_CLIENT_ID", hide_env_values = true)]
    pub client_id: String,

    /// The client secret that matches the client ID.
    #[arg(env = "GENOMICS_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,

    /// Dataset searched for the sample's read group set.
    #[arg(long, default_value = DEFAULT_DATASET_ID)]
    pub dataset_id: String,

    /// Variant set searched for the sample's call set. Defaults to the dataset id.
    #[arg(long)]
    pub variant_set_id: Option<String>,

    #[arg(long, default_value = "NA12872")]
    pub sample: String,

    #[arg(long, default_value = "22")]
    pub reference_name: String,

    /// 0-based position on the reference.
    #[arg(
        long,
        default_value_t = 51003835,
        value_parser = clap::value_parser!(i64).range(0..i64::MAX)
    )]
    pub position: i64,

    /// Maximum number of reads fetched.
    #[arg(long, default_value_t = 1024)]
    pub page_size: u32,

    /// File holding the cached OAuth2 credential.
    #[arg(long, env = "GENOMICS_TOKEN_CACHE", default_value = ".oauth2_cache.json")]
    pub token_cache: PathBuf,

    /// Receive the authorization code through a browser redirect to a local
    /// listener instead of pasting it.
    #[arg(long)]
    pub local_server: bool,

    /// Port of the local redirect listener.
    #[arg(long, default_value_t = LocalServerReceiver::DEFAULT_PORT, requires = "local_server")]
    pub redirect_port: u16,

    /// Only print the consent URL; do not launch a browser.
    #[arg(long, requires = "local_server")]
    pub no_browser: bool,

    #[arg(long, env = "GENOMICS_API_ROOT", default_value = DEFAULT_API_ROOT)]
    pub api_root: String,

    /// OAuth2 token endpoint used for code exchange and refresh.
    #[arg(long, env = "GENOMICS_TOKEN_URL", default_value = ACCESS_TOKEN_URL)]
    pub token_url: String,
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("dataset_id", &self.dataset_id)
            .field("variant_set_id", &self.variant_set_id)
            .field("sample", &self.sample)
            .field("reference_name", &self.reference_name)
            .field("position", &self.position)
            .field("page_size", &self.page_size)
            .field("token_cache", &self.token_cache)
            .field("local_server", &self.local_server)
            .field("redirect_port", &self.redirect_port)
            .field("no_browser", &self.no_browser)
            .field("api_root", &self.api_root)
            .field("token_url", &self.token_url)
            .finish()
    }
}

impl Args {
    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }

    pub fn query(&self) -> Query {
        Query {
            dataset_id: self.dataset_id.clone(),
            variant_set_id: self
                .variant_set_id
                .clone()
                .unwrap_or_else(|| self.dataset_id.clone()),
            sample: self.sample.clone(),
            reference_name: self.reference_name.clone(),
            position: self.position,
            page_size: self.page_size,
        }
    }
}
