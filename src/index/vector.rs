//! Vector Index - HNSW 근사 최근접 이웃 검색
//!
//! 그래프는 청크 ID 오름차순으로 삽입하고, 각 노드의 레벨은 청크 ID의
//! 해시로 정하므로 같은 캡슐을 다시 로드해도 동일한 그래프가 만들어집니다.
//! 벡터 수가 `exact_threshold` 이하이거나 필터가 있는 조회는 전수 검색합니다.
//!
//! ref: https://arxiv.org/abs/1603.09320

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::cmp::Reverse;

use tokio_util::sync::CancellationToken;

use crate::config::VectorConfig;
use crate::error::{RagcapError, Result};

use super::{check_cancelled, rank_desc, ChunkFilter, ChunkId, Metric, ScoredChunk};

/// 전수 검색 시 취소 확인 주기
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// 레벨 상한
const MAX_LEVEL: usize = 16;

// ============================================================================
// Types
// ============================================================================

/// 메트릭 전처리된 벡터를 연속 메모리에 보관
#[derive(Debug)]
struct Vectors {
    dimension: usize,
    data: Vec<f32>,
}

impl Vectors {
    fn get(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dimension;
        &self.data[start..start + self.dimension]
    }
}

/// 탐색 후보 (유사도가 높을수록, 동점이면 노드 번호가 낮을수록 큼)
#[derive(Debug, Clone, Copy)]
struct Candidate {
    similarity: f32,
    node: u32,
}

impl Candidate {
    fn new(similarity: f32, node: u32) -> Self {
        Self { similarity, node }
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.similarity
            .total_cmp(&other.similarity)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// 계층 그래프
#[derive(Debug, Default)]
struct Graph {
    /// [노드][레이어] → 이웃 노드
    links: Vec<Vec<Vec<u32>>>,
    entry: Option<u32>,
    max_level: usize,
}

/// 벡터 인덱스
#[derive(Debug)]
pub struct VectorIndex {
    ids: Vec<ChunkId>,
    vectors: Vectors,
    metric: Metric,
    params: VectorConfig,
    graph: Option<Graph>,
}

// ============================================================================
// VectorIndex
// ============================================================================

impl VectorIndex {
    /// 인덱스 구축
    ///
    /// 길이가 `dimension`과 다른 벡터가 있으면 `DimensionMismatch`.
    pub fn build(
        dimension: usize,
        params: VectorConfig,
        mut entries: Vec<(ChunkId, Vec<f32>)>,
    ) -> Result<Self> {
        entries.sort_by_key(|(id, _)| *id);
        entries.dedup_by_key(|(id, _)| *id);

        let mut ids = Vec::with_capacity(entries.len());
        let mut data = Vec::with_capacity(entries.len() * dimension);

        for (id, mut vector) in entries {
            if vector.len() != dimension {
                return Err(RagcapError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            params.metric.prepare(&mut vector);
            ids.push(id);
            data.extend_from_slice(&vector);
        }

        let vectors = Vectors { dimension, data };

        let graph = if ids.len() > params.exact_threshold {
            Some(build_graph(&ids, &vectors, params.metric, &params)?)
        } else {
            None
        };

        tracing::debug!(
            "Vector index built: {} vectors, dim={}, metric={}, graph={}",
            ids.len(),
            dimension,
            params.metric,
            graph.is_some()
        );

        Ok(Self {
            ids,
            vectors,
            metric: params.metric,
            params,
            graph,
        })
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 청크의 전처리된 벡터 (없으면 None)
    pub fn vector_of(&self, chunk_id: ChunkId) -> Option<&[f32]> {
        self.ids
            .binary_search(&chunk_id)
            .ok()
            .map(|node| self.vectors.get(node as u32))
    }

    /// HNSW 그래프 사용 여부
    pub fn uses_graph(&self) -> bool {
        self.graph.is_some()
    }

    /// 유사도 검색
    pub fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&ChunkFilter>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredChunk>> {
        if embedding.len() != self.dimension() {
            return Err(RagcapError::DimensionMismatch {
                expected: self.dimension(),
                actual: embedding.len(),
            });
        }

        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = embedding.to_vec();
        self.metric.prepare(&mut query);

        match (&self.graph, filter) {
            (Some(graph), None) => self.search_graph(graph, &query, top_k, cancel),
            _ => self.exact_scan(&query, top_k, filter, cancel),
        }
    }

    fn exact_scan(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&ChunkFilter>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredChunk>> {
        let mut results = Vec::new();

        for (node, &id) in self.ids.iter().enumerate() {
            if node % CANCEL_CHECK_INTERVAL == 0 {
                check_cancelled(cancel)?;
            }

            if let Some(f) = filter {
                if !f.allows(id) {
                    continue;
                }
            }

            let similarity = self.metric.similarity(query, self.vectors.get(node as u32));
            results.push(ScoredChunk::new(id, similarity));
        }

        Ok(rank_desc(results, top_k))
    }

    fn search_graph(
        &self,
        graph: &Graph,
        query: &[f32],
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(mut entry) = graph.entry else {
            return Ok(Vec::new());
        };

        for layer in (1..=graph.max_level).rev() {
            entry = graph.greedy(query, entry, layer, &self.vectors, self.metric, cancel)?;
        }

        let ef = self.params.ef_search.max(top_k);
        let found = graph.search_layer(query, &[entry], ef, 0, &self.vectors, self.metric, cancel)?;

        let results = found
            .into_iter()
            .map(|c| ScoredChunk::new(self.ids[c.node as usize], c.similarity))
            .collect();

        Ok(rank_desc(results, top_k))
    }
}

// ============================================================================
// Graph Construction
// ============================================================================

fn build_graph(
    ids: &[ChunkId],
    vectors: &Vectors,
    metric: Metric,
    params: &VectorConfig,
) -> Result<Graph> {
    let never = CancellationToken::new();
    let level_mult = 1.0 / (params.m as f64).ln();

    let mut graph = Graph {
        links: Vec::with_capacity(ids.len()),
        ..Default::default()
    };

    for (node, &id) in ids.iter().enumerate() {
        let level = assign_level(id, level_mult);
        graph.insert(node as u32, level, vectors, metric, params, &never)?;
    }

    Ok(graph)
}

impl Graph {
    fn insert(
        &mut self,
        node: u32,
        level: usize,
        vectors: &Vectors,
        metric: Metric,
        params: &VectorConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.links.push(vec![Vec::new(); level + 1]);

        let Some(mut entry) = self.entry else {
            self.entry = Some(node);
            self.max_level = level;
            return Ok(());
        };

        let query = vectors.get(node);

        for layer in (level + 1..=self.max_level).rev() {
            entry = self.greedy(query, entry, layer, vectors, metric, cancel)?;
        }

        let mut entry_points = vec![entry];

        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(
                query,
                &entry_points,
                params.ef_construction,
                layer,
                vectors,
                metric,
                cancel,
            )?;

            let max_links = if layer == 0 { params.m * 2 } else { params.m };
            let selected: Vec<u32> = found.iter().take(params.m).map(|c| c.node).collect();

            for &neighbor in &selected {
                let list = &mut self.links[neighbor as usize][layer];
                list.push(node);

                if list.len() > max_links {
                    let base = vectors.get(neighbor);
                    let mut scored: Vec<Candidate> = list
                        .iter()
                        .map(|&other| Candidate::new(metric.similarity(base, vectors.get(other)), other))
                        .collect();
                    scored.sort_by(|a, b| b.cmp(a));
                    scored.truncate(max_links);
                    *list = scored.into_iter().map(|c| c.node).collect();
                }
            }

            self.links[node as usize][layer] = selected;
            entry_points = found.into_iter().map(|c| c.node).collect();
        }

        if level > self.max_level {
            self.entry = Some(node);
            self.max_level = level;
        }

        Ok(())
    }

    /// 단일 레이어 탐욕 탐색 (ef = 1)
    fn greedy(
        &self,
        query: &[f32],
        entry: u32,
        layer: usize,
        vectors: &Vectors,
        metric: Metric,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let found = self.search_layer(query, &[entry], 1, layer, vectors, metric, cancel)?;
        Ok(found.first().map(|c| c.node).unwrap_or(entry))
    }

    /// 레이어 내 best-first 탐색, 좋은 순서로 반환
    #[allow(clippy::too_many_arguments)]
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        vectors: &Vectors,
        metric: Metric,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>> {
        let mut visited = vec![false; self.links.len()];
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut found: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();

        for &ep in entry_points {
            if std::mem::replace(&mut visited[ep as usize], true) {
                continue;
            }
            let c = Candidate::new(metric.similarity(query, vectors.get(ep)), ep);
            candidates.push(c);
            found.push(Reverse(c));
            if found.len() > ef {
                found.pop();
            }
        }

        while let Some(current) = candidates.pop() {
            check_cancelled(cancel)?;

            if let Some(Reverse(worst)) = found.peek() {
                if current < *worst && found.len() >= ef {
                    break;
                }
            }

            let Some(neighbors) = self.links[current.node as usize].get(layer) else {
                continue;
            };

            for &next in neighbors {
                if std::mem::replace(&mut visited[next as usize], true) {
                    continue;
                }

                let c = Candidate::new(metric.similarity(query, vectors.get(next)), next);
                let admit = found.len() < ef
                    || found.peek().map(|Reverse(w)| c > *w).unwrap_or(true);

                if admit {
                    candidates.push(c);
                    found.push(Reverse(c));
                    if found.len() > ef {
                        found.pop();
                    }
                }
            }
        }

        let mut result: Vec<Candidate> = found.into_iter().map(|Reverse(c)| c).collect();
        result.sort_by(|a, b| b.cmp(a));
        Ok(result)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 청크 ID로부터 결정적 레벨 산출
fn assign_level(chunk_id: ChunkId, level_mult: f64) -> usize {
    let hash = splitmix64(chunk_id as u64);
    // (0, 1] 균등 분포
    let uniform = ((hash >> 11) as f64 + 1.0) / (1u64 << 53) as f64;
    let level = (-uniform.ln() * level_mult).floor() as usize;
    level.min(MAX_LEVEL)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// 결정적 의사난수 벡터
    fn pseudo_vector(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| {
                let h = splitmix64(seed.wrapping_mul(1_000_003).wrapping_add(i as u64));
                (h >> 40) as f32 / (1u64 << 24) as f32 - 0.5
            })
            .collect()
    }

    fn small_index() -> VectorIndex {
        VectorIndex::build(
            3,
            VectorConfig::default(),
            vec![
                (3, vec![0.0, 0.0, 1.0]),
                (1, vec![1.0, 0.0, 0.0]),
                (2, vec![0.9, 0.1, 0.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_exact_query_order() {
        let index = small_index();
        let token = CancellationToken::new();
        assert!(!index.uses_graph());

        let results = index.query(&[1.0, 0.0, 0.0], 2, None, &token).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, 1);
        assert_eq!(results[1].chunk_id, 2);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_vector_of_returns_prepared_vector() {
        let index = small_index();
        assert_eq!(index.vector_of(3), Some(&[0.0, 0.0, 1.0][..]));

        let two = index.vector_of(2).unwrap();
        let norm: f32 = two.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        assert!(index.vector_of(9).is_none());
    }

    #[test]
    fn test_dimension_mismatch() {
        let index = VectorIndex::build(
            256,
            VectorConfig::default(),
            vec![(1, vec![0.1; 256]), (2, vec![0.2; 256])],
        )
        .unwrap();
        let token = CancellationToken::new();

        let err = index.query(&vec![0.1; 128], 5, None, &token).unwrap_err();
        assert!(matches!(
            err,
            RagcapError::DimensionMismatch {
                expected: 256,
                actual: 128
            }
        ));
    }

    #[test]
    fn test_build_rejects_wrong_length() {
        let err = VectorIndex::build(4, VectorConfig::default(), vec![(1, vec![1.0, 2.0])])
            .unwrap_err();
        assert!(matches!(err, RagcapError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_tie_break_lower_id() {
        let index = VectorIndex::build(
            2,
            VectorConfig::default(),
            vec![(8, vec![1.0, 0.0]), (5, vec![1.0, 0.0]), (6, vec![0.0, 1.0])],
        )
        .unwrap();
        let token = CancellationToken::new();

        let results = index.query(&[1.0, 0.0], 3, None, &token).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.chunk_id).collect();
        assert_eq!(ids, vec![5, 8, 6]);
    }

    #[test]
    fn test_filtered_query() {
        let index = small_index();
        let token = CancellationToken::new();
        let filter = ChunkFilter::new([3]);

        let results = index.query(&[1.0, 0.0, 0.0], 5, Some(&filter), &token).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, 3);
    }

    #[test]
    fn test_euclidean_metric() {
        let params = VectorConfig {
            metric: Metric::Euclidean,
            ..Default::default()
        };
        let index = VectorIndex::build(
            2,
            params,
            vec![(1, vec![10.0, 10.0]), (2, vec![1.0, 1.0])],
        )
        .unwrap();
        let token = CancellationToken::new();

        let results = index.query(&[0.0, 0.0], 2, None, &token).unwrap();
        assert_eq!(results[0].chunk_id, 2);
    }

    #[test]
    fn test_graph_finds_stored_vectors() {
        let dim = 16;
        let entries: Vec<_> = (1..=600).map(|id| (id, pseudo_vector(id as u64, dim))).collect();
        let index = VectorIndex::build(dim, VectorConfig::default(), entries).unwrap();
        assert!(index.uses_graph());
        assert_eq!(index.len(), 600);

        let token = CancellationToken::new();
        let mut hits = 0;
        for id in (1..=600).step_by(30) {
            let results = index.query(&pseudo_vector(id as u64, dim), 1, None, &token).unwrap();
            if results.first().map(|r| r.chunk_id) == Some(id) {
                hits += 1;
            }
        }
        assert!(hits >= 18, "recall too low: {}/20", hits);
    }

    #[test]
    fn test_graph_is_deterministic() {
        let dim = 8;
        let entries: Vec<_> = (1..=400).map(|id| (id, pseudo_vector(id as u64, dim))).collect();

        let a = VectorIndex::build(dim, VectorConfig::default(), entries.clone()).unwrap();
        let mut reversed = entries;
        reversed.reverse();
        let b = VectorIndex::build(dim, VectorConfig::default(), reversed).unwrap();

        let token = CancellationToken::new();
        let query = pseudo_vector(9999, dim);
        let ra = a.query(&query, 10, None, &token).unwrap();
        let rb = b.query(&query, 10, None, &token).unwrap();
        assert_eq!(ra, rb);
    }

    #[test]
    fn test_cancelled_graph_query() {
        let dim = 8;
        let entries: Vec<_> = (1..=300).map(|id| (id, pseudo_vector(id as u64, dim))).collect();
        let index = VectorIndex::build(dim, VectorConfig::default(), entries).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = index.query(&pseudo_vector(1, dim), 5, None, &token).unwrap_err();
        assert!(matches!(err, RagcapError::Cancelled));
    }

    #[test]
    fn test_assign_level_bounded() {
        let mult = 1.0 / 16f64.ln();
        for id in 0..10_000 {
            assert!(assign_level(id, mult) <= MAX_LEVEL);
        }
        assert_eq!(assign_level(42, mult), assign_level(42, mult));
    }
}
