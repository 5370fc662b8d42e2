//! Basic sync example demonstrating the contact sync engine library

use std::error::Error;
use std::sync::Arc;

use contact_sync::{
    Contact, MemorySnapshotStore, MemorySource, MergeStrategy, ProgressChannel, SourceHandle,
    SyncEngine, SyncEvent, SyncOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("Basic Contact Sync Example");
    println!("==========================");

    let phone = MemorySource::new("phone").with_contacts([
        Contact::new("Ada Lovelace").with_phone("+44 20 7946 0018"),
        Contact::new("Alan Turing").with_email("alan@example.com"),
    ]);
    let laptop = MemorySource::new("laptop")
        .with_contacts([Contact::new("Grace Hopper").with_email("grace@example.com")]);

    let local = SourceHandle::new(phone.clone());
    let remote = SourceHandle::new(laptop.clone());

    let options = SyncOptions {
        merge_strategy: MergeStrategy::UnionFields,
        ..SyncOptions::default()
    };

    let (reporter, mut channel) = ProgressChannel::new();
    let store = Arc::new(MemorySnapshotStore::new());
    let engine = SyncEngine::new(options, store.clone()).with_progress(reporter);

    let progress_handle = tokio::spawn(async move {
        while let Some(event) = channel.recv().await {
            match event {
                SyncEvent::Progress { source, message, .. } => println!("[{}] {}", source, message),
                SyncEvent::EndSync { source, destination } => {
                    println!("Finished syncing {} with {}", source, destination)
                }
                _ => {}
            }
        }
    });

    let report = engine.sync(&local, &remote).await?;
    drop(engine);
    progress_handle.await?;

    println!();
    println!("{}", report.metrics.summary());
    println!("Laptop now holds:");
    for contact in laptop.contacts() {
        println!("  {}", contact.summary());
    }
    println!("Phone now holds {} contacts", phone.contacts().len());
    println!("{} snapshots written", store.len());

    Ok(())
}
