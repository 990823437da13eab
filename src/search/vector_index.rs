//! FVIX (fragment vector index) and exact/approximate k-NN search.
//!
//! Format overview (little-endian):
//!
//! Header (variable size):
//!   Magic: "FVIX" (4 bytes)
//!   Version: u16
//!   EmbedderID length: u16
//!   EmbedderID: bytes
//!   Dimension: u32
//!   Quantization: u8 (0=f32, 1=f16)
//!   Count: u32
//!   HeaderCRC32: u32 (CRC32 of header bytes before this field)
//!
//! Rows (fixed size per entry):
//!   Position: u32 (fragment position in the corpus)
//!   Boost: f32
//!   VecOffset: u64 (offset into vector slab)
//!   ContentHash: [u8; 32] (SHA256 of the fragment text)
//!
//! Vector slab:
//!   Count × Dimension × bytes_per_quant, contiguous, 32-byte aligned.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use half::f16;
use memmap2::Mmap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::VectorConfig;
use crate::model::types::EmbeddedFragment;
use crate::search::ann_index::HnswIndex;
use crate::search::canonicalize::content_hash;

pub const FVIX_MAGIC: [u8; 4] = *b"FVIX";
pub const FVIX_VERSION: u16 = 1;
pub const VECTOR_ALIGN_BYTES: usize = 32;
pub const ROW_SIZE_BYTES: usize = 48;

/// Below this many rows a sequential scan beats rayon's scheduling overhead.
const PARALLEL_THRESHOLD: usize = 10_000;

const PARALLEL_CHUNK_SIZE: usize = 1024;

/// ANN shortlist size as a multiple of `k`, before exact re-scoring.
const ANN_OVERSAMPLE: usize = 4;

/// Set MMSEARCH_PARALLEL_SEARCH=0 to force sequential scans.
static PARALLEL_SEARCH_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    dotenvy::var("MMSEARCH_PARALLEL_SEARCH")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    F32,
    F16,
}

impl Quantization {
    pub fn to_u8(self) -> u8 {
        match self {
            Quantization::F32 => 0,
            Quantization::F16 => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Quantization::F32),
            1 => Ok(Quantization::F16),
            other => bail!("unknown quantization value: {other}"),
        }
    }

    pub fn bytes_per_component(self) -> usize {
        match self {
            Quantization::F32 => 4,
            Quantization::F16 => 2,
        }
    }
}

impl FromStr for Quantization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" => Ok(Quantization::F32),
            "f16" => Ok(Quantization::F16),
            other => Err(other.to_string()),
        }
    }
}

/// Which search path [`VectorIndex::search_top_k`] takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// SIMD inner product, parallel for large indices, HNSW above the ANN threshold.
    #[default]
    Optimized,
    /// Plain cosine-similarity scan.
    Scan,
}

/// Search-time parameters, persisted alongside the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorSearchParams {
    pub ann_threshold: usize,
    pub hnsw_m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub backend: VectorBackend,
}

impl VectorSearchParams {
    pub fn from_config(config: &VectorConfig) -> Self {
        Self {
            ann_threshold: config.ann_threshold,
            hnsw_m: config.hnsw_m,
            ef_construction: config.hnsw_ef_construction,
            ef_search: config.hnsw_ef_search,
            backend: config.backend,
        }
    }
}

impl Default for VectorSearchParams {
    fn default() -> Self {
        Self::from_config(&VectorConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FvixHeader {
    pub version: u16,
    pub embedder_id: String,
    pub dimension: u32,
    pub quantization: Quantization,
    pub count: u32,
}

impl FvixHeader {
    pub fn new(
        embedder_id: impl Into<String>,
        dimension: u32,
        quantization: Quantization,
        count: u32,
    ) -> Result<Self> {
        let header = Self {
            version: FVIX_VERSION,
            embedder_id: embedder_id.into(),
            dimension,
            quantization,
            count,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        let id_len = self.embedder_id.len();
        if id_len > u16::MAX as usize {
            bail!("embedder_id is too long: {id_len}");
        }
        if self.dimension == 0 {
            bail!("dimension must be non-zero");
        }
        Ok(())
    }

    pub fn header_len_bytes(&self) -> Result<usize> {
        self.validate()?;
        Ok(4 + 2 + 2 + self.embedder_id.len() + 4 + 1 + 4 + 4)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        self.validate()?;
        let mut buf = Vec::new();

        buf.extend_from_slice(&FVIX_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());

        let id_bytes = self.embedder_id.as_bytes();
        let id_len = u16::try_from(id_bytes.len())
            .map_err(|_| anyhow!("embedder_id length out of range"))?;
        buf.extend_from_slice(&id_len.to_le_bytes());
        buf.extend_from_slice(id_bytes);

        buf.extend_from_slice(&self.dimension.to_le_bytes());
        buf.push(self.quantization.to_u8());
        buf.extend_from_slice(&self.count.to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();

        writer.write_all(&buf)?;
        writer.write_all(&crc.to_le_bytes())?;
        Ok(buf.len() + 4)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut header_bytes = Vec::new();

        let magic =
            read_exact_array::<4, _>(&mut reader, &mut header_bytes).context("read FVIX magic")?;
        if magic != FVIX_MAGIC {
            bail!("invalid FVIX magic: {:?}", magic);
        }

        let version = read_u16_le(&mut reader, &mut header_bytes).context("read FVIX version")?;
        if version != FVIX_VERSION {
            bail!("unsupported FVIX version: {version}");
        }

        let id_len = read_u16_le(&mut reader, &mut header_bytes)
            .context("read embedder id length")? as usize;
        let id_bytes =
            read_exact_vec(&mut reader, id_len, &mut header_bytes).context("read embedder id")?;
        let embedder_id = String::from_utf8(id_bytes).context("embedder id is not valid UTF-8")?;

        let dimension = read_u32_le(&mut reader, &mut header_bytes).context("read dimension")?;
        let quantization_raw =
            read_exact_array::<1, _>(&mut reader, &mut header_bytes).context("read quantization")?;
        let quantization = Quantization::from_u8(quantization_raw[0])?;
        let count = read_u32_le(&mut reader, &mut header_bytes).context("read count")?;

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf).context("read header crc")?;
        let crc_expected = u32::from_le_bytes(crc_buf);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        let crc_actual = hasher.finalize();
        if crc_actual != crc_expected {
            bail!("header CRC mismatch (expected {crc_expected:#010x}, got {crc_actual:#010x})");
        }

        let header = Self {
            version,
            embedder_id,
            dimension,
            quantization,
            count,
        };
        header.validate()?;
        Ok(header)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRow {
    pub position: u32,
    pub boost: f32,
    pub vec_offset: u64,
    pub content_hash: [u8; 32],
}

impl VectorRow {
    pub fn to_bytes(&self) -> [u8; ROW_SIZE_BYTES] {
        let mut buf = [0u8; ROW_SIZE_BYTES];
        buf[0..4].copy_from_slice(&self.position.to_le_bytes());
        buf[4..8].copy_from_slice(&self.boost.to_le_bytes());
        buf[8..16].copy_from_slice(&self.vec_offset.to_le_bytes());
        buf[16..48].copy_from_slice(&self.content_hash);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != ROW_SIZE_BYTES {
            bail!(
                "vector row size mismatch: expected {ROW_SIZE_BYTES}, got {}",
                buf.len()
            );
        }
        Ok(Self {
            position: u32::from_le_bytes(buf[0..4].try_into()?),
            boost: f32::from_le_bytes(buf[4..8].try_into()?),
            vec_offset: u64::from_le_bytes(buf[8..16].try_into()?),
            content_hash: buf[16..48].try_into()?,
        })
    }
}

/// Input row for [`VectorIndex::build`].
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub position: u32,
    pub boost: f32,
    pub content_hash: [u8; 32],
    pub vector: Vec<f32>,
}

impl VectorEntry {
    pub fn from_embedded(position: u32, embedded: &EmbeddedFragment) -> Self {
        Self {
            position,
            boost: embedded.boost,
            content_hash: content_hash(&embedded.fragment.text),
            vector: embedded.vector.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    /// Fragment position in the corpus.
    pub position: u32,
    pub score: f32,
}

#[derive(Debug)]
pub struct VectorIndex {
    header: FvixHeader,
    rows: Vec<VectorRow>,
    vectors: VectorStorage,
    params: VectorSearchParams,
    ann: Option<HnswIndex>,
}

#[derive(Debug)]
enum VectorStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    /// Slab read in place from a mapped FVIX file.
    Mmap {
        mmap: Mmap,
        offset: usize,
        len: usize,
    },
}

impl VectorIndex {
    pub fn build<I>(
        embedder_id: impl Into<String>,
        dimension: usize,
        quantization: Quantization,
        params: VectorSearchParams,
        entries: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = VectorEntry>,
    {
        if dimension == 0 {
            bail!("dimension must be non-zero");
        }
        let dimension_u32 =
            u32::try_from(dimension).map_err(|_| anyhow!("dimension out of range"))?;

        let entries: Vec<VectorEntry> = entries.into_iter().collect();
        let count_u32 =
            u32::try_from(entries.len()).map_err(|_| anyhow!("entry count out of range"))?;

        let vector_bytes = dimension
            .checked_mul(quantization.bytes_per_component())
            .ok_or_else(|| anyhow!("vector size overflow"))?;
        let mut rows = Vec::with_capacity(entries.len());
        let mut f32_slab = Vec::new();
        let mut f16_slab = Vec::new();
        let mut offset_bytes: usize = 0;

        for entry in &entries {
            if entry.vector.len() != dimension {
                bail!(
                    "vector dimension mismatch: expected {}, got {}",
                    dimension,
                    entry.vector.len()
                );
            }
            rows.push(VectorRow {
                position: entry.position,
                boost: entry.boost,
                vec_offset: u64::try_from(offset_bytes)
                    .map_err(|_| anyhow!("vector offset out of range"))?,
                content_hash: entry.content_hash,
            });
            match quantization {
                Quantization::F32 => f32_slab.extend_from_slice(&entry.vector),
                Quantization::F16 => {
                    f16_slab.extend(entry.vector.iter().map(|v| f16::from_f32(*v)))
                }
            }
            offset_bytes = offset_bytes
                .checked_add(vector_bytes)
                .ok_or_else(|| anyhow!("vector slab size overflow"))?;
        }

        let vectors = match quantization {
            Quantization::F32 => VectorStorage::F32(f32_slab),
            Quantization::F16 => VectorStorage::F16(f16_slab),
        };
        let header = FvixHeader::new(embedder_id, dimension_u32, quantization, count_u32)?;
        let mut index = Self {
            header,
            rows,
            vectors,
            params,
            ann: None,
        };
        index.validate()?;
        index.build_ann_if_needed()?;
        Ok(index)
    }

    /// Index the given fragments, using their corpus positions as row ids.
    pub fn from_embedded(
        embedder_id: impl Into<String>,
        dimension: usize,
        quantization: Quantization,
        params: VectorSearchParams,
        fragments: &[EmbeddedFragment],
    ) -> Result<Self> {
        let entries = fragments
            .iter()
            .enumerate()
            .map(|(idx, fragment)| {
                let position =
                    u32::try_from(idx).map_err(|_| anyhow!("fragment position out of range"))?;
                Ok(VectorEntry::from_embedded(position, fragment))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::build(embedder_id, dimension, quantization, params, entries)
    }

    fn build_ann_if_needed(&mut self) -> Result<()> {
        self.ann = None;
        if self.rows.is_empty()
            || self.params.backend != VectorBackend::Optimized
            || self.rows.len() < self.params.ann_threshold
        {
            return Ok(());
        }
        let vectors = (0..self.rows.len())
            .map(|idx| self.vector_at(idx))
            .collect::<Result<Vec<_>>>()?;
        self.ann = Some(HnswIndex::build(
            &vectors,
            self.dimension(),
            self.params.hnsw_m,
            self.params.ef_construction,
        )?);
        Ok(())
    }

    pub fn load(path: &Path, params: VectorSearchParams) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open FVIX file {path:?}"))?;
        let file_len = file.metadata().context("read FVIX metadata")?.len();
        if file_len == 0 {
            bail!("FVIX file is empty");
        }
        let mmap = unsafe { Mmap::map(&file).context("mmap FVIX file")? };
        let layout = FvixLayout::decode(&mmap[..])
            .with_context(|| format!("decode FVIX file {path:?}"))?;
        let (offset, len) = (layout.slab_offset, layout.slab_len);
        Self::assemble(layout.header, layout.rows, VectorStorage::Mmap { mmap, offset, len }, params)
            .with_context(|| format!("decode FVIX file {path:?}"))
    }

    /// Decode a buffer written by [`Self::write_to`]. The HNSW graph, if the
    /// row count calls for one, is rebuilt from the decoded matrix.
    pub fn from_bytes(bytes: &[u8], params: VectorSearchParams) -> Result<Self> {
        let layout = FvixLayout::decode(bytes)?;
        let slab_bytes = bytes
            .get(layout.slab_offset..layout.slab_offset + layout.slab_len)
            .ok_or_else(|| anyhow!("slab out of bounds"))?;
        let vectors = match layout.header.quantization {
            Quantization::F32 => VectorStorage::F32(decode_f32(slab_bytes)?),
            Quantization::F16 => VectorStorage::F16(decode_f16(slab_bytes)?),
        };
        Self::assemble(layout.header, layout.rows, vectors, params)
    }

    fn assemble(
        header: FvixHeader,
        rows: Vec<VectorRow>,
        vectors: VectorStorage,
        params: VectorSearchParams,
    ) -> Result<Self> {
        let mut index = Self {
            header,
            rows,
            vectors,
            params,
            ann: None,
        };
        index.validate()?;
        index.build_ann_if_needed()?;
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp_path = path.with_extension("fvix.tmp");
        let mut file = File::create(&temp_path)
            .with_context(|| format!("create temp FVIX file {temp_path:?}"))?;
        self.write_to(&mut file)?;
        file.sync_all().context("fsync FVIX temp file")?;
        std::fs::rename(&temp_path, path)
            .with_context(|| format!("rename FVIX temp file {temp_path:?}"))?;
        sync_dir(parent).context("fsync FVIX directory post-rename")?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        if cfg!(target_endian = "big") {
            bail!("FVIX write is only supported on little-endian targets");
        }
        self.validate()?;
        let header_len = self.header.header_len_bytes()?;
        let written = self.header.write_to(&mut writer)?;
        if written != header_len {
            bail!("header length mismatch: expected {header_len}, wrote {written}");
        }

        for row in &self.rows {
            writer.write_all(&row.to_bytes())?;
        }

        let rows_len = rows_size_bytes(self.header.count)?;
        let slab_offset = vector_slab_offset_bytes(header_len, self.header.count)?;
        let padding_len = slab_offset
            .checked_sub(header_len + rows_len)
            .ok_or_else(|| anyhow!("padding length underflow"))?;
        if padding_len > 0 {
            writer.write_all(&vec![0u8; padding_len])?;
        }

        match &self.vectors {
            VectorStorage::F32(values) => {
                for v in values {
                    writer.write_all(&v.to_le_bytes())?;
                }
            }
            VectorStorage::F16(values) => {
                for v in values {
                    writer.write_all(&v.to_le_bytes())?;
                }
            }
            VectorStorage::Mmap { mmap, offset, len } => {
                let bytes = mmap
                    .get(*offset..offset + len)
                    .ok_or_else(|| anyhow!("vector slab out of bounds"))?;
                writer.write_all(bytes)?;
            }
        }
        Ok(())
    }

    /// Top `k` rows by inner product with `query`, best first, ties by position.
    ///
    /// `filter` restricts the scan to the given fragment positions; the HNSW
    /// graph is bypassed when a filter is present.
    pub fn search_top_k(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&BTreeSet<u32>>,
    ) -> Result<Vec<VectorHit>> {
        self.check_query(query)?;
        if k == 0 || self.rows.is_empty() {
            return Ok(Vec::new());
        }
        if self.params.backend == VectorBackend::Scan {
            return self.search_cosine_scan(query, k, filter);
        }
        if filter.is_none()
            && let Some(ann) = &self.ann
        {
            return self.search_ann(ann, query, k);
        }
        if *PARALLEL_SEARCH_ENABLED && self.rows.len() >= PARALLEL_THRESHOLD {
            return self.search_top_k_parallel(query, k, filter);
        }
        self.search_top_k_sequential(query, k, filter)
    }

    /// Full cosine-similarity scan with a plain sort.
    ///
    /// Ranking-equivalent to [`Self::search_top_k`] for unit-length vectors;
    /// a zero vector scores 0.0.
    pub fn search_cosine_scan(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&BTreeSet<u32>>,
    ) -> Result<Vec<VectorHit>> {
        self.check_query(query)?;
        if k == 0 || self.rows.is_empty() {
            return Ok(Vec::new());
        }
        let query_norm = norm(query);
        let mut hits = Vec::with_capacity(self.rows.len());
        for (idx, row) in self.rows.iter().enumerate() {
            if let Some(filter) = filter
                && !filter.contains(&row.position)
            {
                continue;
            }
            let vector = self.vector_at(idx)?;
            let denom = norm(&vector) * query_norm;
            let score = if denom > 0.0 {
                dot_product_scalar(&vector, query) / denom
            } else {
                0.0
            };
            hits.push(VectorHit {
                position: row.position,
                score,
            });
        }
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    fn search_ann(&self, ann: &HnswIndex, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let fetch = k.saturating_mul(ANN_OVERSAMPLE).min(self.rows.len());
        let candidates = ann.search(query, fetch, self.params.ef_search.max(fetch))?;
        let mut hits = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(row) = self.rows.get(candidate.row_idx) else {
                continue;
            };
            hits.push(VectorHit {
                position: row.position,
                score: self.dot_product_at(row.vec_offset, query)?,
            });
        }
        sort_hits(&mut hits);
        hits.truncate(k);
        tracing::trace!(k, returned = hits.len(), "ann search");
        Ok(hits)
    }

    fn search_top_k_sequential(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&BTreeSet<u32>>,
    ) -> Result<Vec<VectorHit>> {
        let mut heap = BinaryHeap::with_capacity(k + 1);
        for row in &self.rows {
            if let Some(filter) = filter
                && !filter.contains(&row.position)
            {
                continue;
            }
            let score = self.dot_product_at(row.vec_offset, query)?;
            heap.push(std::cmp::Reverse(ScoredEntry {
                score,
                position: row.position,
            }));
            if heap.len() > k {
                heap.pop();
            }
        }
        Ok(finish_heap(heap.into_iter().map(|e| e.0)))
    }

    /// Parallel scan over chunks with thread-local heaps, merged at the end.
    fn search_top_k_parallel(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&BTreeSet<u32>>,
    ) -> Result<Vec<VectorHit>> {
        let partial: Result<Vec<Vec<ScoredEntry>>> = self
            .rows
            .par_chunks(PARALLEL_CHUNK_SIZE)
            .map(|chunk| {
                let mut local_heap = BinaryHeap::with_capacity(k + 1);
                for row in chunk {
                    if let Some(f) = filter
                        && !f.contains(&row.position)
                    {
                        continue;
                    }
                    let score = self.dot_product_at(row.vec_offset, query)?;
                    local_heap.push(std::cmp::Reverse(ScoredEntry {
                        score,
                        position: row.position,
                    }));
                    if local_heap.len() > k {
                        local_heap.pop();
                    }
                }
                Ok(local_heap.into_iter().map(|r| r.0).collect())
            })
            .collect();

        let mut final_heap = BinaryHeap::with_capacity(k + 1);
        for entry in partial?.into_iter().flatten() {
            final_heap.push(std::cmp::Reverse(entry));
            if final_heap.len() > k {
                final_heap.pop();
            }
        }
        Ok(finish_heap(final_heap.into_iter().map(|e| e.0)))
    }

    /// Vector of row `idx`, widened to f32.
    pub fn vector_at(&self, idx: usize) -> Result<Vec<f32>> {
        let row = self
            .rows
            .get(idx)
            .ok_or_else(|| anyhow!("row {idx} out of bounds"))?;
        let dimension = self.dimension();
        match &self.vectors {
            VectorStorage::F32(values) => {
                let start = vector_offset_to_index(row.vec_offset, 4)?;
                values
                    .get(start..start + dimension)
                    .map(<[f32]>::to_vec)
                    .ok_or_else(|| anyhow!("vector slice out of bounds"))
            }
            VectorStorage::F16(values) => {
                let start = vector_offset_to_index(row.vec_offset, 2)?;
                values
                    .get(start..start + dimension)
                    .map(|slice| slice.iter().map(|v| f32::from(*v)).collect())
                    .ok_or_else(|| anyhow!("vector slice out of bounds"))
            }
            VectorStorage::Mmap { .. } => {
                let bytes = self.mapped_vector(row.vec_offset, dimension)?;
                match self.header.quantization {
                    Quantization::F32 => Ok(cast_f32(bytes)?.to_vec()),
                    Quantization::F16 => Ok(cast_f16(bytes)?.iter().map(|v| f32::from(*v)).collect()),
                }
            }
        }
    }

    pub fn header(&self) -> &FvixHeader {
        &self.header
    }

    pub fn rows(&self) -> &[VectorRow] {
        &self.rows
    }

    pub fn params(&self) -> &VectorSearchParams {
        &self.params
    }

    pub fn dimension(&self) -> usize {
        self.header.dimension as usize
    }

    pub fn embedder_id(&self) -> &str {
        &self.header.embedder_id
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn uses_ann(&self) -> bool {
        self.ann.is_some()
    }

    fn check_query(&self, query: &[f32]) -> Result<()> {
        if query.len() != self.dimension() {
            bail!(
                "query dimension mismatch: expected {}, got {}",
                self.header.dimension,
                query.len()
            );
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.header.validate()?;
        if self.rows.len() != self.header.count as usize {
            bail!(
                "row count mismatch: expected {}, got {}",
                self.header.count,
                self.rows.len()
            );
        }
        let expected_slab = vector_slab_size_bytes(
            self.header.count,
            self.header.dimension,
            self.header.quantization,
        )?;
        let actual_slab = match (&self.vectors, self.header.quantization) {
            (VectorStorage::F32(values), Quantization::F32) => values.len() * 4,
            (VectorStorage::F16(values), Quantization::F16) => values.len() * 2,
            (VectorStorage::Mmap { len, .. }, _) => *len,
            _ => bail!("vector storage does not match header quantization"),
        };
        if expected_slab != actual_slab {
            bail!(
                "vector slab size mismatch: expected {}, got {}",
                expected_slab,
                actual_slab
            );
        }
        let vector_bytes = self.dimension() * self.header.quantization.bytes_per_component();
        for (idx, row) in self.rows.iter().enumerate() {
            let offset = usize::try_from(row.vec_offset)
                .map_err(|_| anyhow!("row {idx} vector offset out of range"))?;
            let end = offset
                .checked_add(vector_bytes)
                .ok_or_else(|| anyhow!("row {idx} vector offset overflow"))?;
            if end > expected_slab {
                bail!("row {idx} vector offset out of bounds");
            }
        }
        Ok(())
    }

    fn dot_product_at(&self, vec_offset: u64, query: &[f32]) -> Result<f32> {
        match &self.vectors {
            VectorStorage::F32(values) => {
                let start = vector_offset_to_index(vec_offset, 4)?;
                let slice = values
                    .get(start..start + query.len())
                    .ok_or_else(|| anyhow!("vector slice out of bounds"))?;
                Ok(dot_product(slice, query))
            }
            VectorStorage::F16(values) => {
                let start = vector_offset_to_index(vec_offset, 2)?;
                let slice = values
                    .get(start..start + query.len())
                    .ok_or_else(|| anyhow!("vector slice out of bounds"))?;
                Ok(dot_product_f16(slice, query))
            }
            VectorStorage::Mmap { .. } => {
                let bytes = self.mapped_vector(vec_offset, query.len())?;
                match self.header.quantization {
                    Quantization::F32 => Ok(dot_product(cast_f32(bytes)?, query)),
                    Quantization::F16 => Ok(dot_product_f16(cast_f16(bytes)?, query)),
                }
            }
        }
    }

    /// Bytes of one `dimension`-wide vector inside the mapped slab.
    fn mapped_vector(&self, vec_offset: u64, dimension: usize) -> Result<&[u8]> {
        let VectorStorage::Mmap { mmap, offset, len } = &self.vectors else {
            bail!("vector storage is not memory-mapped");
        };
        let start = usize::try_from(vec_offset).map_err(|_| anyhow!("vector offset out of range"))?;
        let byte_len = dimension
            .checked_mul(self.header.quantization.bytes_per_component())
            .ok_or_else(|| anyhow!("vector slice overflow"))?;
        let end = start
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("vector slice overflow"))?;
        if end > *len {
            bail!("vector slice out of bounds");
        }
        mmap.get(offset + start..offset + end)
            .ok_or_else(|| anyhow!("vector slice out of bounds"))
    }
}

/// Header, rows and slab location of an encoded FVIX buffer.
struct FvixLayout {
    header: FvixHeader,
    rows: Vec<VectorRow>,
    slab_offset: usize,
    slab_len: usize,
}

impl FvixLayout {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if cfg!(target_endian = "big") {
            bail!("FVIX load is only supported on little-endian targets");
        }
        let mut cursor = Cursor::new(bytes);
        let header = FvixHeader::read_from(&mut cursor).context("read FVIX header")?;
        let header_len = header.header_len_bytes()?;
        let rows_len = rows_size_bytes(header.count)?;
        let slab_offset = vector_slab_offset_bytes(header_len, header.count)?;
        let slab_len = vector_slab_size_bytes(header.count, header.dimension, header.quantization)?;

        let expected_len = slab_offset
            .checked_add(slab_len)
            .ok_or_else(|| anyhow!("FVIX size overflow"))?;
        if bytes.len() != expected_len {
            bail!(
                "FVIX size mismatch (expected {}, got {})",
                expected_len,
                bytes.len()
            );
        }

        let rows = bytes
            .get(header_len..header_len + rows_len)
            .ok_or_else(|| anyhow!("rows out of bounds"))?
            .chunks_exact(ROW_SIZE_BYTES)
            .map(VectorRow::from_bytes)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            header,
            rows,
            slab_offset,
            slab_len,
        })
    }
}

pub fn rows_size_bytes(count: u32) -> Result<usize> {
    (count as usize)
        .checked_mul(ROW_SIZE_BYTES)
        .ok_or_else(|| anyhow!("row size overflow for count {count}"))
}

pub fn vector_slab_offset_bytes(header_len: usize, count: u32) -> Result<usize> {
    let rows_len = rows_size_bytes(count)?;
    let end = header_len
        .checked_add(rows_len)
        .ok_or_else(|| anyhow!("offset overflow"))?;
    Ok(align_up(end, VECTOR_ALIGN_BYTES))
}

pub fn vector_slab_size_bytes(
    count: u32,
    dimension: u32,
    quantization: Quantization,
) -> Result<usize> {
    (count as usize)
        .checked_mul(dimension as usize)
        .and_then(|components| components.checked_mul(quantization.bytes_per_component()))
        .ok_or_else(|| anyhow!("vector slab size overflow"))
}

fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    let rem = value % align;
    if rem == 0 { value } else { value + (align - rem) }
}

fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.position.cmp(&b.position))
    });
}

fn finish_heap(entries: impl Iterator<Item = ScoredEntry>) -> Vec<VectorHit> {
    let mut hits: Vec<VectorHit> = entries
        .map(|e| VectorHit {
            position: e.position,
            score: e.score,
        })
        .collect();
    sort_hits(&mut hits);
    hits
}

#[derive(Debug, Clone)]
struct ScoredEntry {
    score: f32,
    position: u32,
}

impl PartialEq for ScoredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredEntry {}

impl PartialOrd for ScoredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// "Greater" means "ranks better": higher score, then lower position.
impl Ord for ScoredEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.position.cmp(&self.position))
    }
}

fn vector_offset_to_index(offset: u64, bytes_per: usize) -> Result<usize> {
    let bytes_per_u64 = bytes_per as u64;
    if !offset.is_multiple_of(bytes_per_u64) {
        bail!("vector offset is not aligned to component size");
    }
    usize::try_from(offset / bytes_per_u64).map_err(|_| anyhow!("vector offset out of range"))
}

fn decode_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if !bytes.len().is_multiple_of(4) {
        bail!("f32 byte slice length is not a multiple of 4");
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_f16(bytes: &[u8]) -> Result<Vec<f16>> {
    if !bytes.len().is_multiple_of(2) {
        bail!("f16 byte slice length is not a multiple of 2");
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| f16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn cast_f32(bytes: &[u8]) -> Result<&[f32]> {
    if !bytes.len().is_multiple_of(4) {
        bail!("f32 byte slice length is not a multiple of 4");
    }
    // SAFETY: length and alignment are checked before the slice is used as f32.
    let (prefix, aligned, suffix) = unsafe { bytes.align_to::<f32>() };
    if !prefix.is_empty() || !suffix.is_empty() {
        bail!("f32 byte slice is not aligned");
    }
    Ok(aligned)
}

fn cast_f16(bytes: &[u8]) -> Result<&[f16]> {
    if !bytes.len().is_multiple_of(2) {
        bail!("f16 byte slice length is not a multiple of 2");
    }
    // SAFETY: length and alignment are checked before the slice is used as f16.
    let (prefix, aligned, suffix) = unsafe { bytes.align_to::<f16>() };
    if !prefix.is_empty() || !suffix.is_empty() {
        bail!("f16 byte slice is not aligned");
    }
    Ok(aligned)
}

fn norm(v: &[f32]) -> f32 {
    dot_product_scalar(v, v).sqrt()
}

#[inline]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// 8-lane SIMD dot product. Reordered additions give ~1e-7 relative error
/// against the scalar sum, which does not change rankings.
#[inline]
fn dot_product_simd(a: &[f32], b: &[f32]) -> f32 {
    use wide::f32x8;

    let chunks_a = a.chunks_exact(8);
    let chunks_b = b.chunks_exact(8);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    let mut sum = f32x8::ZERO;
    for (ca, cb) in chunks_a.zip(chunks_b) {
        let mut arr_a = [0.0f32; 8];
        let mut arr_b = [0.0f32; 8];
        arr_a.copy_from_slice(ca);
        arr_b.copy_from_slice(cb);
        sum += f32x8::from(arr_a) * f32x8::from(arr_b);
    }

    let mut scalar_sum: f32 = sum.reduce_add();
    for (a, b) in remainder_a.iter().zip(remainder_b) {
        scalar_sum += a * b;
    }
    scalar_sum
}

#[doc(hidden)]
pub fn dot_product_scalar_bench(a: &[f32], b: &[f32]) -> f32 {
    dot_product_scalar(a, b)
}

#[doc(hidden)]
pub fn dot_product_simd_bench(a: &[f32], b: &[f32]) -> f32 {
    dot_product_simd(a, b)
}

/// Set MMSEARCH_SIMD_DOT=0 to use the scalar dot product.
static SIMD_DOT_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    dotenvy::var("MMSEARCH_SIMD_DOT")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

#[inline]
fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if *SIMD_DOT_ENABLED {
        dot_product_simd(a, b)
    } else {
        dot_product_scalar(a, b)
    }
}

#[inline]
fn dot_product_f16(a: &[f16], b: &[f32]) -> f32 {
    use wide::f32x8;

    if !*SIMD_DOT_ENABLED {
        return a.iter().zip(b).map(|(x, y)| f32::from(*x) * y).sum();
    }
    let chunks_a = a.chunks_exact(8);
    let chunks_b = b.chunks_exact(8);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    let mut sum = f32x8::ZERO;
    for (ca, cb) in chunks_a.zip(chunks_b) {
        let mut arr_a = [0.0f32; 8];
        let mut arr_b = [0.0f32; 8];
        for (dst, src) in arr_a.iter_mut().zip(ca) {
            *dst = f32::from(*src);
        }
        arr_b.copy_from_slice(cb);
        sum += f32x8::from(arr_a) * f32x8::from(arr_b);
    }
    let mut scalar_sum = sum.reduce_add();
    for (a, b) in remainder_a.iter().zip(remainder_b) {
        scalar_sum += f32::from(*a) * b;
    }
    scalar_sum
}

fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

fn read_u16_le<R: Read>(reader: &mut R, header_bytes: &mut Vec<u8>) -> Result<u16> {
    let buf = read_exact_array::<2, _>(reader, header_bytes)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le<R: Read>(reader: &mut R, header_bytes: &mut Vec<u8>) -> Result<u32> {
    let buf = read_exact_array::<4, _>(reader, header_bytes)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact_vec<R: Read>(
    reader: &mut R,
    len: usize,
    header_bytes: &mut Vec<u8>,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    header_bytes.extend_from_slice(&buf);
    Ok(buf)
}

fn read_exact_array<const N: usize, R: Read>(
    reader: &mut R,
    header_bytes: &mut Vec<u8>,
) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    header_bytes.extend_from_slice(&buf);
    Ok(buf)
}
