use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::HashMap;
use stepgraph_checkpoint::{
    ChannelVersion, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver,
    InMemorySaver,
};

fn sample_checkpoint() -> Checkpoint {
    let mut checkpoint = Checkpoint::empty();
    for i in 0..16 {
        let name = format!("channel_{i}");
        checkpoint
            .channel_values
            .insert(name.clone(), serde_json::json!({"seq": i, "data": "x".repeat(64)}));
        checkpoint
            .channel_versions
            .insert(name, ChannelVersion::Int(i));
    }
    checkpoint
}

fn bench_put(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("in_memory_put", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let saver = InMemorySaver::new();
                let config = CheckpointConfig::new("bench-thread");
                saver
                    .put(
                        &config,
                        sample_checkpoint(),
                        CheckpointMetadata::new().with_step(0),
                        HashMap::new(),
                    )
                    .await
                    .unwrap();
            })
        })
    });
}

fn bench_get_tuple(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let saver = InMemorySaver::new();
    let config = CheckpointConfig::new("bench-thread");

    runtime.block_on(async {
        for step in 0..64 {
            saver
                .put(
                    &config,
                    sample_checkpoint(),
                    CheckpointMetadata::new().with_step(step),
                    HashMap::new(),
                )
                .await
                .unwrap();
        }
    });

    c.bench_function("in_memory_get_tuple_latest", |b| {
        b.iter(|| {
            runtime.block_on(async {
                saver.get_tuple(&config).await.unwrap().unwrap();
            })
        })
    });
}

criterion_group!(benches, bench_put, bench_get_tuple);
criterion_main!(benches);
