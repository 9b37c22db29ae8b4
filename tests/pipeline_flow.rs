//! End-to-end flow over the public API: admission, generation, listing,
//! editing, and the retention sweep, wired with in-memory collaborators.

use artbot_core::config::Config;
use artbot_core::error::{Error, ErrorDetails};
use artbot_core::ledger::{CounterStore, InMemoryCounterStore};
use artbot_core::pipeline::RequestPipeline;
use artbot_core::provider::ImageProvider;
use artbot_core::records::{InMemoryMetadataStore, MetadataStore};
use artbot_core::storage::{ArtifactStore, InMemoryArtifactStore};
use artbot_core::sweeper::RetentionSweeper;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing_test::traced_test;

struct CannedProvider;

#[async_trait]
impl ImageProvider for CannedProvider {
    async fn generate(&self, _prompt: &str) -> Result<Bytes, Error> {
        Ok(Bytes::from_static(b"generated"))
    }

    async fn edit(&self, source: &[u8], _prompt: &str) -> Result<Bytes, Error> {
        let mut out = source.to_vec();
        out.extend_from_slice(b"+edited");
        Ok(Bytes::from(out))
    }
}

struct World {
    pipeline: RequestPipeline,
    sweeper: RetentionSweeper,
    artifacts: Arc<InMemoryArtifactStore>,
}

fn world() -> World {
    let config: Config = toml::from_str(
        r#"
        cooldown_seconds = 1
        daily_limit = 10
        global_monthly_limit = 100
        prompt_excerpt_len = 32

        [provider]
        base_url = "https://provider.test/models/flux"
        api_key = "test-key"
        "#,
    )
    .expect("config should parse");
    config.validate().expect("config should validate");

    let metadata = Arc::new(InMemoryMetadataStore::new());
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let counters = Arc::new(InMemoryCounterStore::new());

    let pipeline = RequestPipeline::new(
        &config,
        Arc::new(CannedProvider),
        Arc::clone(&artifacts) as Arc<dyn ArtifactStore>,
        Arc::clone(&metadata) as Arc<dyn MetadataStore>,
        Arc::clone(&counters) as Arc<dyn CounterStore>,
    );
    let sweeper = RetentionSweeper::new(
        config.sweep_interval(),
        Arc::clone(&artifacts) as Arc<dyn ArtifactStore>,
        Arc::clone(&metadata) as Arc<dyn MetadataStore>,
    );

    World {
        pipeline,
        sweeper,
        artifacts,
    }
}

#[tokio::test(start_paused = true)]
async fn generate_edit_list_lifecycle() {
    let w = world();

    let first = w
        .pipeline
        .generate("alice", "a floating island at dawn")
        .await
        .expect("first generate should succeed");
    assert_eq!(first.sequence, 1);
    assert_eq!(first.bytes, Bytes::from_static(b"generated"));

    tokio::time::advance(std::time::Duration::from_secs(2)).await;

    let edited = w
        .pipeline
        .edit("alice", 1, "add a waterfall")
        .await
        .expect("edit of an existing image should succeed");
    assert_eq!(edited.sequence, 2);
    assert_eq!(edited.bytes, Bytes::from_static(b"generated+edited"));

    let listed = w.pipeline.list("alice").await.expect("list should succeed");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].sequence, 1);
    assert_eq!(listed[0].prompt_excerpt, "a floating island at dawn");
    assert_eq!(listed[1].sequence, 2);
    assert_eq!(listed[1].prompt_excerpt, "add a waterfall");

    let stats = w.pipeline.stats("alice").await.expect("stats");
    assert_eq!(stats.daily_used, 2);
    assert_eq!(stats.total_generated, 2);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn sweep_removes_artifacts_and_their_records() {
    let w = world();

    w.pipeline
        .generate("alice", "a mechanical butterfly")
        .await
        .expect("generate should succeed");
    assert_eq!(w.artifacts.len(), 1);

    w.sweeper.sweep_once().await;
    assert!(logs_contain("artifact retention sweep complete"));

    // The cascade leaves no dangling references behind.
    assert!(w.artifacts.is_empty());
    assert!(w
        .pipeline
        .list("alice")
        .await
        .expect("list should succeed")
        .is_empty());

    // Addressing the swept image now reports NotFound, not a storage fault.
    tokio::time::advance(std::time::Duration::from_secs(2)).await;
    let err = w
        .pipeline
        .edit("alice", 1, "bring it back")
        .await
        .expect_err("edit of a swept image should fail");
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ImageNotFound { .. }
    ));
}
