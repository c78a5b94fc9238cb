use synced_json::{BufferContext, BufferMode, MemoryStore, Registry};
use tracing_subscriber::EnvFilter;

// RUST_LOG=synced_json=debug shows every write and skipped write.
fn main() -> Result<(), synced_json::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = MemoryStore::new();
    let context = BufferContext::builder()
        .mode(BufferMode::SerializedFile)
        .build();
    let registry = Registry::with_context(context);
    let doc = registry.document_with(store.backend("job")).open_dict()?;

    // Write-through outside a scope.
    doc.set("epoch", 0)?;
    println!("writes after first set: {}", store.write_count("job"));

    // One write for the whole loop.
    registry.with_buffer(|| {
        for epoch in 1..=100 {
            doc.set("epoch", epoch)?;
        }
        Ok(())
    })?;
    println!("writes after buffered loop: {}", store.write_count("job"));

    // Content ends up where it started, so nothing is written.
    registry.with_buffer(|| {
        doc.set("epoch", -1)?;
        doc.set("epoch", 100)?;
        Ok(())
    })?;
    println!("writes after no-op scope: {}", store.write_count("job"));

    // Scopes nest; only the outermost flushes.
    let outer = registry.buffered();
    doc.set("stage", "train")?;
    {
        let inner = registry.buffered();
        doc.set("stage", "eval")?;
        inner.finish()?;
    }
    println!("pending before outer exit: {:?}", registry.context().pending_resources());
    outer.finish()?;
    println!("writes at the end: {}", store.write_count("job"));
    Ok(())
}
