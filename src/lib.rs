//! Tarka: a persistent RDF quad store with a SPARQL 1.1 engine.
//!
//! # Architecture
//!
//! Data flows leaves-first through the crate:
//!
//! - [`atom`]: strings intern to dense 32-bit ids over memory-mapped files.
//! - [`index`]: three on-disk B+Trees order quad keys in the SPO, POS and
//!   OSP component permutations (graph id leading).
//! - [`store`]: the quad-store facade — index selection, batched writes
//!   behind a WAL, one reader-writer lock.
//! - [`sparql`]: zero-copy parser, greedy planner, nested-loop scan
//!   operators over a shared binding table, and the solution pipeline.
//! - [`reason`]: RDFS/OWL forward-chaining materializer.
//! - [`io`]: RDF format negotiation, the parser/writer sink contract, and
//!   the line-oriented codecs with an async bulk loader.
//!
//! # Example
//!
//! ```rust,no_run
//! use tarka::Store;
//!
//! let store = Store::open("my-db").unwrap();
//! store.update(
//!     "INSERT DATA { <http://example.org/a> <http://example.org/name> \"Alice\" }",
//! ).unwrap();
//!
//! let results = store.query(
//!     "SELECT ?name WHERE { ?who <http://example.org/name> ?name }",
//! ).unwrap();
//! ```

pub mod atom;
pub mod index;
pub mod io;
pub mod reason;
pub mod sparql;
pub mod store;
pub mod term;

// Re-export main types for convenience
pub use atom::{AtomError, AtomId, AtomStore};
pub use io::{negotiate, IoError, RdfFormat};
pub use reason::{ReasonError, Reasoner, RuleSet};
pub use sparql::{
    CancelFlag, ConstructedTriple, ExecError, ParseError, QueryResults, Solutions, SparqlEngine,
    SparqlError,
};
pub use store::{Quad, QuadPattern, Store, StoreError, StoreStats};
pub use term::{Term, Value};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
        assert_eq!(ver, "1.0.0");
    }
}
