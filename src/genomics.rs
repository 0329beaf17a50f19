use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, Url};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::auth::Credential;
use crate::error::{Error, Result};

pub const DEFAULT_API_ROOT: &str = "https://genomics.googleapis.com/v1/";

/// The four searches the quickstart needs from the remote service.
#[async_trait]
pub trait GenomicsApi {
    async fn search_read_group_sets(
        &self,
        request: &SearchReadGroupSetsRequest,
    ) -> Result<Vec<ReadGroupSet>>;

    async fn search_reads(&self, request: &SearchReadsRequest) -> Result<Vec<Read>>;

    async fn search_call_sets(&self, request: &SearchCallSetsRequest) -> Result<Vec<CallSet>>;

    async fn search_variants(&self, request: &SearchVariantsRequest) -> Result<Vec<Variant>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchReadGroupSetsRequest {
    pub dataset_ids: Vec<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchReadsRequest {
    pub read_group_set_ids: Vec<String>,
    pub reference_name: String,
    pub start: i64,
    pub end: i64,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCallSetsRequest {
    pub variant_set_ids: Vec<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchVariantsRequest {
    pub call_set_ids: Vec<String>,
    pub reference_name: String,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadGroupSet {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Read {
    pub alignment: Option<LinearAlignment>,
    pub aligned_sequence: Option<String>,
}

impl Read {
    /// Start position and sequence of a placed read.
    pub fn placement(&self) -> Option<(i64, &str)> {
        let position = self.alignment.as_ref()?.position.as_ref()?;
        Some((position.position, self.aligned_sequence.as_deref()?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearAlignment {
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(default, deserialize_with = "parse_int64")]
    pub position: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSet {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub reference_bases: String,
    #[serde(default)]
    pub alternate_bases: Vec<String>,
    #[serde(default)]
    pub calls: Vec<VariantCall>,
}

impl Variant {
    /// First variant name, falling back to the variant id.
    pub fn display_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantCall {
    #[serde(default)]
    pub genotype: Vec<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchReadGroupSetsResponse {
    #[serde(default)]
    read_group_sets: Vec<ReadGroupSet>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchReadsResponse {
    #[serde(default)]
    alignments: Vec<Read>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchCallSetsResponse {
    #[serde(default)]
    call_sets: Vec<CallSet>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchVariantsResponse {
    #[serde(default)]
    variants: Vec<Variant>,
}

/// int64 values arrive as JSON strings; plain numbers are accepted too.
fn parse_int64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| de::Error::custom(format!("{n} does not fit in an int64")))?,
        Value::String(s) => s.parse().map_err(de::Error::custom)?,
        _ => return Err(de::Error::custom("Wrong type, expected int64")),
    })
}

/// HTTP binding of [`GenomicsApi`] authorized with a bearer credential.
#[derive(Debug, Clone)]
pub struct GenomicsClient {
    client: Client,
    api_root: Url,
    credential: Credential,
}

impl GenomicsClient {
    pub fn new(api_root: &str, credential: Credential) -> Result<Self> {
        let mut api_root =
            Url::parse(api_root).map_err(|err| Error::InvalidUrl(format!("{api_root}: {err}")))?;
        if !api_root.path().ends_with('/') {
            let path = format!("{}/", api_root.path());
            api_root.set_path(&path);
        }

        let client = ClientBuilder::new()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| Error::Transport {
                endpoint: api_root.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            api_root,
            credential,
        })
    }

    pub fn api_root(&self) -> &Url {
        &self.api_root
    }

    async fn search<Req, Resp>(&self, endpoint: &str, fields: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self
            .api_root
            .join(endpoint)
            .map_err(|err| Error::InvalidUrl(format!("{endpoint}: {err}")))?;
        debug!(%url, fields, "sending search request");

        let response = self
            .client
            .post(url)
            .query(&[("fields", fields)])
            .bearer_auth(self.credential.bearer_token())
            .json(request)
            .send()
            .await
            .map_err(|source| Error::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint: endpoint.to_string(),
                status,
                body,
            });
        }

        response.json::<Resp>().await.map_err(|source| Error::Transport {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}

#[async_trait]
impl GenomicsApi for GenomicsClient {
    async fn search_read_group_sets(
        &self,
        request: &SearchReadGroupSetsRequest,
    ) -> Result<Vec<ReadGroupSet>> {
        let response: SearchReadGroupSetsResponse = self
            .search("readgroupsets/search", "readGroupSets(id)", request)
            .await?;
        Ok(response.read_group_sets)
    }

    async fn search_reads(&self, request: &SearchReadsRequest) -> Result<Vec<Read>> {
        let response: SearchReadsResponse = self
            .search(
                "reads/search",
                "alignments(alignment,alignedSequence),nextPageToken",
                request,
            )
            .await?;
        if response.next_page_token.is_some() {
            debug!(
                page_size = request.page_size,
                "more reads are available; only the first page is used"
            );
        }
        Ok(response.alignments)
    }

    async fn search_call_sets(&self, request: &SearchCallSetsRequest) -> Result<Vec<CallSet>> {
        let response: SearchCallSetsResponse = self
            .search("callsets/search", "callSets(id)", request)
            .await?;
        Ok(response.call_sets)
    }

    async fn search_variants(&self, request: &SearchVariantsRequest) -> Result<Vec<Variant>> {
        let response: SearchVariantsResponse = self
            .search(
                "variants/search",
                "variants(id,names,referenceBases,alternateBases,calls(genotype))",
                request,
            )
            .await?;
        Ok(response.variants)
    }
}
