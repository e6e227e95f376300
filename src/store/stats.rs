//! Statistics from the search store
//!
//! This module provides functionality for extracting and displaying
//! per-index document counts.

use crate::store::{IndexInfo, SearchStore, StoreResult};

/// Store statistics summary
#[derive(Debug, Clone)]
pub struct StoreStatistics {
    /// Every index, ordered by name
    pub indexes: Vec<IndexInfo>,

    /// Documents across all indexes
    pub total_documents: u64,
}

/// Loads statistics from the store
///
/// # Arguments
///
/// * `store` - The store to query
///
/// # Returns
///
/// * `Ok(StoreStatistics)` - Successfully loaded statistics
/// * `Err(StoreError)` - Failed to query statistics
pub async fn load_statistics(store: &dyn SearchStore) -> StoreResult<StoreStatistics> {
    let indexes = store.list_indexes().await?;
    let total_documents = indexes.iter().map(|index| index.documents).sum();

    Ok(StoreStatistics {
        indexes,
        total_documents,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &StoreStatistics) {
    println!("=== Index Statistics ===\n");

    println!("Overview:");
    println!("  Indexes: {}", stats.indexes.len());
    println!("  Total documents: {}", stats.total_documents);
    println!();

    if stats.indexes.is_empty() {
        println!("No indexes yet.");
        return;
    }

    println!("Documents by Index:");
    let mut by_size: Vec<_> = stats.indexes.iter().collect();
    by_size.sort_by(|a, b| b.documents.cmp(&a.documents).then(a.name.cmp(&b.name)));

    for index in by_size {
        let percentage = if stats.total_documents > 0 {
            (index.documents as f64 / stats.total_documents as f64) * 100.0
        } else {
            0.0
        };
        println!(
            "  {}: {} ({:.1}%), {} dims, {}",
            index.name, index.documents, percentage, index.dims, index.similarity
        );
        match &index.last_indexed_at {
            Some(at) => println!("    last indexed {}", at),
            None => println!("    created {}, never written", index.created_at),
        }
    }
    println!();
}
