use mosaic_core::ChunkIdent;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A finished bundler compilation, captured at the emit phase.
///
/// By this point the bundler has finalised numeric module ids and chunk file
/// names; the rewriter only replaces the textual addresses used to cross the
/// module graph, never the graph itself.
#[derive(Debug, Clone)]
pub struct Compilation {
    /// Public path prefix cross-chunk asset URLs are built from.
    pub public_path: String,
    pub chunks: Vec<Chunk>,
}

impl Compilation {
    /// All modules of all chunks, in chunk order.
    pub fn modules(&self) -> impl Iterator<Item = &ChunkModule> {
        self.chunks.iter().flat_map(|chunk| &chunk.modules)
    }

    pub fn chunk_by_number(&self, id: u64) -> Option<&Chunk> {
        self.chunks
            .iter()
            .find(|chunk| chunk.id == ChunkIdent::Number(id))
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkIdent,
    pub name: String,
    pub hash: String,
    /// Asset file names, first one being the chunk script itself.
    pub files: Vec<String>,
    pub entry: bool,
    pub modules: Vec<ChunkModule>,
}

#[derive(Debug, Clone)]
pub struct ChunkModule {
    /// The bundler's internal numeric id, the target of rewriting.
    pub id: u64,
    /// Absolute source path; for context modules, the directory globbed.
    pub path: PathBuf,
    pub source: ModuleSource,
}

#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// An ordinary module body as emitted by the bundler.
    Regular { text: String },
    /// A directory-glob require: original request strings mapped to the
    /// numeric id of the module each request resolved to.
    Context { requests: BTreeMap<String, u64> },
    /// A reference the bundler left to the host environment.
    External { request: String },
}
