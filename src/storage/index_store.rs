//! Index directory layout and round-trip.
//!
//! ```text
//! <dir>/vectors.fvix   raw vector matrix (only when a vector index exists)
//! <dir>/index.json     fragments, semantic/facet data, fusion and extractor
//!                      configuration, vector search parameters, build stats
//! ```
//!
//! `index.json` is written last, so a directory with a readable `index.json`
//! always has a matching `vectors.fvix`. The HNSW graph is not stored; it is
//! rebuilt from the matrix when the row count calls for one.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::types::ContentFragment;
use crate::search::facet_index::{FacetIndex, FacetRules};
use crate::search::fusion::FusionConfig;
use crate::search::index::{BuildStats, ComprehensiveIndex};
use crate::search::semantic_index::SemanticIndex;
use crate::search::text_features::TextFeatureConfig;
use crate::search::vector_index::{VectorIndex, VectorSearchParams};

pub const VECTORS_FILE: &str = "vectors.fvix";
pub const DOCUMENT_FILE: &str = "index.json";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("index document {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("vector file: {0:#}")]
    Vector(anyhow::Error),
    #[error("corrupt index: {0}")]
    Corrupt(String),
    #[error("no index found at {0:?}")]
    Missing(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    format_version: u32,
    created_at: DateTime<Utc>,
    has_vectors: bool,
    vector_params: VectorSearchParams,
    fragments: Vec<ContentFragment>,
    semantic: SemanticIndex,
    facet: FacetIndex,
    fusion: FusionConfig,
    text_config: TextFeatureConfig,
    facet_rules: FacetRules,
    stats: BuildStats,
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    pub fn document_path(&self) -> PathBuf {
        self.dir.join(DOCUMENT_FILE)
    }

    pub fn exists(&self) -> bool {
        self.document_path().is_file()
    }

    pub fn save(&self, index: &ComprehensiveIndex) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let vectors_path = self.vectors_path();
        let vector_params = match index.vector() {
            Some(vector) => {
                vector.save(&vectors_path).map_err(StoreError::Vector)?;
                *vector.params()
            }
            None => {
                if vectors_path.exists() {
                    std::fs::remove_file(&vectors_path)?;
                }
                VectorSearchParams::default()
            }
        };

        let document = IndexDocument {
            format_version: FORMAT_VERSION,
            created_at: index.created_at(),
            has_vectors: index.vector().is_some(),
            vector_params,
            fragments: index.fragments().to_vec(),
            semantic: index.semantic().clone(),
            facet: index.facet().clone(),
            fusion: index.fusion().clone(),
            text_config: index.text_config().clone(),
            facet_rules: index.facet_rules().clone(),
            stats: index.stats().clone(),
        };
        let path = self.document_path();
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            serde_json::to_writer(&mut writer, &document).map_err(|source| StoreError::Json {
                path: path.clone(),
                source,
            })?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|err| StoreError::Io(err.error))?;
        info!(dir = %self.dir.display(), fragments = index.len(), "index saved");
        Ok(())
    }

    pub fn load(&self) -> Result<ComprehensiveIndex, StoreError> {
        let path = self.document_path();
        if !path.is_file() {
            return Err(StoreError::Missing(self.dir.clone()));
        }
        let file = File::open(&path)?;
        let document: IndexDocument = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| StoreError::Json {
                path: path.clone(),
                source,
            })?;
        if document.format_version != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                document.format_version
            )));
        }

        let vector = if document.has_vectors {
            let vectors_path = self.vectors_path();
            if !vectors_path.is_file() {
                return Err(StoreError::Corrupt(format!(
                    "{VECTORS_FILE} is missing from {:?}",
                    self.dir
                )));
            }
            let vector = VectorIndex::load(&vectors_path, document.vector_params)
                .map_err(StoreError::Vector)?;
            debug!(rows = vector.len(), ann = vector.uses_ann(), "vector index loaded");
            Some(vector)
        } else {
            None
        };

        ComprehensiveIndex::new(
            document.fragments,
            vector,
            document.semantic,
            document.facet,
            document.fusion,
            &document.text_config,
            document.facet_rules,
            document.stats,
            document.created_at,
        )
        .map_err(|err| StoreError::Corrupt(err.to_string()))
    }
}
