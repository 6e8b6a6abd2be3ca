mod buildbucket;
mod gitiles;
mod http;
mod output_property;
mod policy;

pub use buildbucket::{BuildOrchestrator, BuildbucketClient};
pub use gitiles::{GitilesClient, SourceControl};
pub use http::RetryingClient;
pub use output_property::OutputPropertyPolicy;
pub use policy::{FailurePolicy, PolicyRegistry};
