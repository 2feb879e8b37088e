//! Bulk loading of line-oriented RDF into the store.
//!
//! The async path reads the input stream line by line (suspending on the
//! reader), parses each statement, and commits in batches so one bad
//! statement fails the load without leaving a half-applied tail batch
//! visible.

use super::ntriples::parse_line;
use super::{IoError, IoResult, RdfFormat};
use crate::store::Store;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::info;

/// Statements per commit during bulk loads.
const BATCH_SIZE: usize = 4096;

/// Load a complete document from a string. Only the line-oriented formats
/// have in-tree codecs.
pub fn load_str(store: &Store, format: RdfFormat, input: &str) -> IoResult<usize> {
    let allow_graph = match format {
        RdfFormat::NTriples => false,
        RdfFormat::NQuads => true,
        other => return Err(IoError::UnsupportedFormat(other)),
    };

    let mut count = 0usize;
    let mut batch = store.batch();
    for (index, line) in input.lines().enumerate() {
        if let Some((s, p, o, g)) = parse_line(line, index + 1, allow_graph)? {
            batch.add_text(&s, &p, &o, g.as_deref().unwrap_or(""))?;
            count += 1;
            if batch.len() >= BATCH_SIZE {
                batch.commit()?;
                batch = store.batch();
            }
        }
    }
    batch.commit()?;
    info!(count, ?format, "loaded document");
    Ok(count)
}

/// Load from an asynchronous reader, suspending on input. Statements are
/// committed in batches of [`BATCH_SIZE`].
pub async fn load_async<R>(store: &Store, format: RdfFormat, reader: R) -> IoResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let allow_graph = match format {
        RdfFormat::NTriples => false,
        RdfFormat::NQuads => true,
        other => return Err(IoError::UnsupportedFormat(other)),
    };

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut count = 0usize;
    let mut batch = store.batch();
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if let Some((s, p, o, g)) = parse_line(&line, line_no, allow_graph)? {
            batch.add_text(&s, &p, &o, g.as_deref().unwrap_or(""))?;
            count += 1;
            if batch.len() >= BATCH_SIZE {
                batch.commit()?;
                batch = store.batch();
            }
        }
    }
    batch.commit()?;
    info!(count, ?format, "loaded document");
    Ok(count)
}

/// Serialize the whole store: N-Triples writes the default graph,
/// N-Quads every graph.
pub fn serialize_store<W: std::io::Write>(
    store: &Store,
    format: RdfFormat,
    writer: &mut W,
) -> IoResult<usize> {
    let reader = store.reader();
    let atoms = store.atoms();
    let mut count = 0usize;
    match format {
        RdfFormat::NTriples => {
            let pattern = crate::store::QuadPattern {
                g: Some(0),
                ..Default::default()
            };
            for quad in reader.scan(pattern)? {
                let quad = quad?;
                let s = atoms.resolve(quad.s).map_err(crate::store::StoreError::from)?;
                let p = atoms.resolve(quad.p).map_err(crate::store::StoreError::from)?;
                let o = atoms.resolve(quad.o).map_err(crate::store::StoreError::from)?;
                super::ntriples::write_ntriples(writer, [[s.as_str(), p.as_str(), o.as_str()]])?;
                count += 1;
            }
        }
        RdfFormat::NQuads => {
            for quad in reader.scan(crate::store::QuadPattern::default())? {
                let quad = quad?;
                let s = atoms.resolve(quad.s).map_err(crate::store::StoreError::from)?;
                let p = atoms.resolve(quad.p).map_err(crate::store::StoreError::from)?;
                let o = atoms.resolve(quad.o).map_err(crate::store::StoreError::from)?;
                let g = if quad.g == 0 {
                    None
                } else {
                    Some(atoms.resolve(quad.g).map_err(crate::store::StoreError::from)?)
                };
                super::ntriples::write_nquads(
                    writer,
                    [([s.as_str(), p.as_str(), o.as_str()], g.as_deref())],
                )?;
                count += 1;
            }
        }
        other => return Err(IoError::UnsupportedFormat(other)),
    }
    Ok(count)
}

/// Feed a whole document through a caller-supplied sink instead of the
/// store, for collaborators that post-process quads.
pub fn parse_into<S: super::QuadSink + ?Sized>(
    format: RdfFormat,
    input: &str,
    sink: &mut S,
) -> IoResult<usize> {
    match format {
        RdfFormat::NTriples => super::ntriples::parse_ntriples(input, sink),
        RdfFormat::NQuads => super::ntriples::parse_nquads(input, sink),
        other => Err(IoError::UnsupportedFormat(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DOC: &str = "\
<http://x/a> <http://x/name> \"Alice\" .
<http://x/b> <http://x/name> \"Bob\" .
";

    #[test]
    fn test_load_str() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let count = load_str(&store, RdfFormat::NTriples, DOC).unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.stats().quad_count, 2);
    }

    #[test]
    fn test_load_async() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let count = runtime
            .block_on(load_async(&store, RdfFormat::NTriples, DOC.as_bytes()))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.stats().quad_count, 2);
    }

    #[test]
    fn test_unsupported_format() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(matches!(
            load_str(&store, RdfFormat::RdfXml, ""),
            Err(IoError::UnsupportedFormat(RdfFormat::RdfXml))
        ));
    }

    #[test]
    fn test_round_trip_through_store() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let quads = "\
<http://x/a> <http://x/p> \"v\"@en <http://g/1> .
<http://x/a> <http://x/p> \"plain\" .
";
        load_str(&store, RdfFormat::NQuads, quads).unwrap();

        let mut out = Vec::new();
        let count = serialize_store(&store, RdfFormat::NQuads, &mut out).unwrap();
        assert_eq!(count, 2);

        let dir2 = TempDir::new().unwrap();
        let store2 = Store::open(dir2.path()).unwrap();
        load_str(&store2, RdfFormat::NQuads, &String::from_utf8(out).unwrap()).unwrap();
        assert_eq!(store2.stats().quad_count, 2);
    }
}
