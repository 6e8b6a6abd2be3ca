use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use url::Url;

use crate::error::{CulpritError, Result};
use crate::model::{Build, BuildId, BuildStatus, BuilderId, GitilesCommit, Step};

use super::http::RetryingClient;

const BUILD_FIELDS: &str = "id,number,builder,status,input,output,steps,tags";
const SEARCH_FIELDS: &str =
    "builds.*.id,builds.*.number,builds.*.builder,builds.*.status,builds.*.input.gitilesCommit";

/// The CI service that schedules and runs builds.
#[async_trait]
pub trait BuildOrchestrator: Send + Sync {
    /// Builds on `builder` older than `before`, newest first. Returned builds
    /// carry no steps or output properties.
    async fn search_builds_on_builder(
        &self,
        builder: &BuilderId,
        before: BuildId,
        page_size: usize,
    ) -> Result<Vec<Build>>;

    /// Full detail of one build, including steps and output properties.
    async fn get_build(&self, id: BuildId) -> Result<Build>;

    /// Schedules a new build of `builder` at `commit`.
    async fn trigger_build(
        &self,
        builder: &BuilderId,
        commit: &GitilesCommit,
        properties: Map<String, Value>,
        tags: &[(String, String)],
    ) -> Result<Build>;
}

/// Buildbucket v2 client speaking pRPC with JSON payloads.
pub struct BuildbucketClient {
    http: RetryingClient,
    base_url: Url,
}

impl BuildbucketClient {
    /// Creates a client for `host` (e.g. `cr-buildbucket.appspot.com`). A
    /// full URL is accepted as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the host does not form a valid URL.
    pub fn new(host: &str, http: RetryingClient) -> Result<Self> {
        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        let base_url = Url::parse(&base)
            .map_err(|e| CulpritError::Config(format!("Invalid Buildbucket host: {e}")))?;

        Ok(Self { http, base_url })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T> {
        let url = self
            .base_url
            .join(&format!("prpc/buildbucket.v2.Builds/{method}"))
            .map_err(|e| CulpritError::Config(format!("Invalid Buildbucket URL: {e}")))?;

        debug!("Calling Buildbucket {method}");
        let text = self
            .http
            .send(|client| {
                client
                    .post(url.clone())
                    .header(ACCEPT, "application/json")
                    .json(body)
            })
            .await?;

        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl BuildOrchestrator for BuildbucketClient {
    async fn search_builds_on_builder(
        &self,
        builder: &BuilderId,
        before: BuildId,
        page_size: usize,
    ) -> Result<Vec<Build>> {
        let request = json!({
            "predicate": {
                "builder": builder_json(builder),
                "build": { "endBuildId": before.to_string() },
            },
            "pageSize": page_size,
            "fields": SEARCH_FIELDS,
        });

        let response: SearchBuildsResponse = self.call("SearchBuilds", &request).await?;
        let mut builds: Vec<Build> = response.builds.into_iter().map(Build::from).collect();
        builds.sort_by(|a, b| b.number.cmp(&a.number));

        debug!("Found {} earlier builds on {builder}", builds.len());
        Ok(builds)
    }

    async fn get_build(&self, id: BuildId) -> Result<Build> {
        let request = json!({
            "id": id.to_string(),
            "fields": BUILD_FIELDS,
        });

        let build: BuildProto = self.call("GetBuild", &request).await?;
        Ok(build.into())
    }

    async fn trigger_build(
        &self,
        builder: &BuilderId,
        commit: &GitilesCommit,
        properties: Map<String, Value>,
        tags: &[(String, String)],
    ) -> Result<Build> {
        let request = json!({
            "builder": builder_json(builder),
            "gitilesCommit": {
                "host": commit.host,
                "project": commit.project,
                "ref": commit.ref_,
                "id": commit.id,
            },
            "properties": properties,
            "tags": tags
                .iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect::<Vec<_>>(),
            "fields": BUILD_FIELDS,
        });

        let build: Build = self
            .call::<BuildProto>("ScheduleBuild", &request)
            .await
            .map_err(|e| CulpritError::Trigger(e.to_string()))?
            .into();

        info!(
            "Scheduled build {} on {builder} at {}",
            build.id, commit.id
        );
        Ok(build)
    }
}

fn builder_json(builder: &BuilderId) -> Value {
    json!({
        "project": builder.project,
        "bucket": builder.bucket,
        "builder": builder.builder,
    })
}

/// Proto3 JSON encodes int64 as a string; accept both forms.
fn de_int64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(value) => Ok(value),
        IntOrString::Str(value) => value.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct SearchBuildsResponse {
    #[serde(default)]
    builds: Vec<BuildProto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildProto {
    #[serde(deserialize_with = "de_int64")]
    id: i64,
    #[serde(default)]
    number: u64,
    builder: BuilderId,
    #[serde(default)]
    status: BuildStatus,
    #[serde(default)]
    input: InputProto,
    #[serde(default)]
    output: OutputProto,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    tags: Vec<StringPair>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InputProto {
    #[serde(default)]
    gitiles_commit: GitilesCommit,
}

#[derive(Deserialize, Default)]
struct OutputProto {
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Deserialize)]
struct StringPair {
    key: String,
    value: String,
}

impl From<BuildProto> for Build {
    fn from(proto: BuildProto) -> Self {
        Self {
            id: proto.id,
            number: proto.number,
            builder: proto.builder,
            status: proto.status,
            gitiles_commit: proto.input.gitiles_commit,
            steps: proto.steps,
            output_properties: proto.output.properties,
            tags: proto
                .tags
                .into_iter()
                .map(|pair| (pair.key, pair.value))
                .collect(),
        }
    }
}
