//! Minimap graph derived from scenes: nodes carry client-authored layout,
//! edges are always recomputed from hotspots.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::fsio::{self, CorruptBackups};
use crate::mirror::Published;
use crate::paths::{DocKind, PathResolver};
use crate::scenes::{deserialize_id, Scene};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
	#[serde(deserialize_with = "deserialize_id")]
	pub id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub floor: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub x: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub y: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub positions: Option<Value>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl GraphNode {
	pub fn has_position(&self) -> bool {
		self.x.is_some() || self.y.is_some() || self.positions.as_ref().map(truthy).unwrap_or(false)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
	#[serde(deserialize_with = "deserialize_id")]
	pub from: String,
	#[serde(deserialize_with = "deserialize_id")]
	pub to: String,
	#[serde(default)]
	pub label: String,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Graph {
	pub nodes: Vec<GraphNode>,
	pub edges: Vec<GraphEdge>,
}

fn truthy(v: &Value) -> bool {
	match v {
		Value::Null => false,
		Value::Bool(b) => *b,
		Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
		Value::String(s) => !s.is_empty(),
		Value::Array(a) => !a.is_empty(),
		Value::Object(o) => !o.is_empty(),
	}
}

fn parse_items<T: serde::de::DeserializeOwned>(items: Option<&Value>, what: &str) -> Vec<T> {
	let Some(Value::Array(items)) = items else { return Vec::new() };
	items
		.iter()
		.filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
			Ok(parsed) => Some(parsed),
			Err(err) => {
				debug!(%err, "skipping malformed graph {what}");
				None
			}
		})
		.collect()
}

impl Graph {
	/// Lenient parse of a stored graph; malformed entries are skipped.
	pub fn from_stored(value: &Value) -> Option<Graph> {
		let obj = value.as_object()?;
		Some(Graph { nodes: parse_items(obj.get("nodes"), "node"), edges: parse_items(obj.get("edges"), "edge") })
	}

	/// Strict parse of a client-supplied graph: both keys required.
	pub fn from_client(value: Value) -> StoreResult<Graph> {
		let Value::Object(mut obj) = value else {
			return Err(StoreError::Validation("graph must be a JSON object".into()));
		};
		let (Some(nodes), Some(edges)) = (obj.remove("nodes"), obj.remove("edges")) else {
			return Err(StoreError::Validation("invalid graph data, must have 'nodes' and 'edges'".into()));
		};
		let nodes: Vec<GraphNode> = serde_json::from_value(nodes).map_err(|e| StoreError::Validation(format!("nodes: {e}")))?;
		let edges: Vec<GraphEdge> = serde_json::from_value(edges).map_err(|e| StoreError::Validation(format!("edges: {e}")))?;
		Ok(Graph { nodes, edges })
	}

	pub fn nodes_with_positions(&self) -> usize {
		self.nodes.iter().filter(|n| n.has_position()).count()
	}
}

/// One node per scene and one edge per hotspot with a target. Carries no layout.
pub fn generate_from_scenes(scenes: &[Scene]) -> Graph {
	let mut graph = Graph::default();
	for scene in scenes {
		graph.nodes.push(GraphNode {
			id: scene.id.clone(),
			label: Some(Value::String(scene.label())),
			floor: Some(scene.floor()),
			x: None,
			y: None,
			positions: None,
			extra: Map::new(),
		});
		for hotspot in scene.hotspots() {
			if let Some(target) = hotspot.target {
				graph.edges.push(GraphEdge { from: scene.id.clone(), to: target, label: hotspot.label, extra: Map::new() });
			}
		}
	}
	graph
}

/// Merge by node id. Identity fields come from `incoming`, layout falls back
/// to `previous` when `incoming` lacks it. With `keep_orphans`, previous
/// nodes missing from `incoming` are appended unchanged.
pub fn merge_nodes(incoming: Vec<GraphNode>, previous: &[GraphNode], keep_orphans: bool) -> Vec<GraphNode> {
	let by_id: HashMap<&str, &GraphNode> = previous.iter().map(|n| (n.id.as_str(), n)).collect();
	let mut merged: Vec<GraphNode> = incoming
		.into_iter()
		.map(|new| match by_id.get(new.id.as_str()) {
			None => new,
			Some(old) => {
				let mut extra = old.extra.clone();
				extra.extend(new.extra);
				GraphNode {
					label: new.label.or_else(|| old.label.clone()),
					floor: new.floor.or_else(|| old.floor.clone()),
					x: new.x.or_else(|| old.x.clone()),
					y: new.y.or_else(|| old.y.clone()),
					positions: match new.positions {
						Some(p) if truthy(&p) => Some(p),
						_ => old.positions.clone(),
					},
					id: new.id,
					extra,
				}
			}
		})
		.collect();
	if keep_orphans {
		let present: HashSet<String> = merged.iter().map(|n| n.id.clone()).collect();
		for old in previous {
			if !present.contains(&old.id) {
				debug!(node_id = %old.id, "keeping node without a scene");
				merged.push(old.clone());
			}
		}
	}
	merged
}

/// Shortest hotspot path between two scenes, or `None` when unreachable.
pub fn shortest_route(scenes: &[Scene], from: &str, to: &str) -> Option<Vec<String>> {
	if from == to {
		return Some(vec![from.to_string()]);
	}
	let mut g: DiGraph<String, ()> = DiGraph::new();
	let mut index: HashMap<String, NodeIndex> = HashMap::new();
	let mut node = |g: &mut DiGraph<String, ()>, id: &str| *index.entry(id.to_string()).or_insert_with(|| g.add_node(id.to_string()));
	for scene in scenes {
		let src = node(&mut g, &scene.id);
		for target in scene.neighbor_ids() {
			let dst = node(&mut g, &target);
			g.update_edge(src, dst, ());
		}
	}
	let (start, goal) = (*index.get(from)?, *index.get(to)?);
	let (_, path) = astar(&g, start, |n| n == goal, |_| 1u32, |_| 0)?;
	Some(path.into_iter().map(|i| g[i].clone()).collect())
}

#[derive(Debug, Serialize)]
pub struct RegenerateReport {
	pub nodes: usize,
	pub edges: usize,
	pub nodes_with_positions: usize,
}

#[derive(Debug, Serialize)]
pub struct SaveReport {
	pub path: PathBuf,
	pub nodes: usize,
	pub edges: usize,
}

#[derive(Debug, Serialize)]
pub struct CleanupReport {
	pub removed_nodes: Vec<String>,
	pub removed_count: usize,
	pub remaining_nodes: usize,
	pub remaining_edges: usize,
}

pub struct GraphStore {
	resolver: PathResolver,
	graph: Graph,
	path: PathBuf,
	backups: CorruptBackups,
}

impl GraphStore {
	pub fn open(resolver: PathResolver) -> StoreResult<Self> {
		let path = resolver.resolve(DocKind::Graph)?;
		let mut store = Self { resolver, graph: Graph::default(), path, backups: CorruptBackups::default() };
		if let Some(g) = store.read_disk() {
			store.graph = g;
		}
		Ok(store)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Existing non-empty candidate, else the primary location.
	fn write_path(&self) -> PathBuf {
		self.resolver
			.find_existing(DocKind::Graph)
			.unwrap_or_else(|| fsio::absolutize(&self.resolver.default_path(DocKind::Graph)))
	}

	fn read_disk(&mut self) -> Option<Graph> {
		let path = self.write_path();
		if !path.exists() {
			return None;
		}
		let parsed = fsio::read_json::<Value>(&path).ok().and_then(|v| Graph::from_stored(&v));
		match parsed {
			Some(g) => {
				self.path = path;
				Some(g)
			}
			None => {
				warn!(path = %path.display(), "graph file unreadable");
				if fsio::is_non_empty_file(&path) {
					self.backups.backup_file(&path);
				}
				None
			}
		}
	}

	/// Current stored graph, re-read from disk every time; falls back to a
	/// graph generated from `scenes` when there is no usable file.
	pub fn read(&mut self, scenes: &[Scene]) -> Graph {
		match self.read_disk() {
			Some(g) => {
				self.graph = g.clone();
				g
			}
			None => {
				debug!("no graph file, generating from scenes");
				generate_from_scenes(scenes)
			}
		}
	}

	/// Stored graph with nodes refreshed from `scenes` and edges taken from
	/// current hotspots. Nothing is written.
	pub fn view(&mut self, scenes: &[Scene]) -> Graph {
		let stored = self.read(scenes);
		if scenes.is_empty() {
			return stored;
		}
		let fresh = generate_from_scenes(scenes);
		Graph { nodes: merge_nodes(fresh.nodes, &stored.nodes, true), edges: fresh.edges }
	}

	/// File contents as-is, or the in-memory copy if the file is unusable.
	pub fn raw(&mut self) -> Graph {
		match self.read_disk() {
			Some(g) => g,
			None => self.graph.clone(),
		}
	}

	fn persist(&mut self, graph: Graph) -> StoreResult<Published> {
		let path = self.write_path();
		let bytes = fsio::to_pretty_bytes(&graph)?;
		fsio::write_atomic(&path, &bytes)?;
		self.path = path.clone();
		self.graph = match fsio::read_json::<Value>(&path).ok().and_then(|v| Graph::from_stored(&v)) {
			Some(g) => g,
			None => {
				warn!(path = %path.display(), "could not reload graph after save");
				graph
			}
		};
		Ok(Published::new(DocKind::Graph, path, bytes))
	}

	/// Rebuild from scenes, keeping stored layout and nodes without scenes.
	pub fn regenerate(&mut self, scenes: &[Scene]) -> StoreResult<(RegenerateReport, Published)> {
		let previous = self.read_disk().unwrap_or_default();
		let fresh = generate_from_scenes(scenes);
		let merged = Graph { nodes: merge_nodes(fresh.nodes, &previous.nodes, true), edges: fresh.edges };
		let report = RegenerateReport { nodes: merged.nodes.len(), edges: merged.edges.len(), nodes_with_positions: merged.nodes_with_positions() };
		let published = self.persist(merged)?;
		info!(nodes = report.nodes, edges = report.edges, with_positions = report.nodes_with_positions, "regenerated graph");
		Ok((report, published))
	}

	/// Store a client-edited graph. Client edges are kept verbatim; node
	/// layout falls back to what is on disk.
	pub fn save(&mut self, client: Value) -> StoreResult<(SaveReport, Published)> {
		let incoming = Graph::from_client(client)?;
		let previous = self.read_disk().unwrap_or_default();
		let merged = Graph { nodes: merge_nodes(incoming.nodes, &previous.nodes, false), edges: incoming.edges };
		let with_positions = merged.nodes_with_positions();
		let (nodes, edges) = (merged.nodes.len(), merged.edges.len());
		let published = self.persist(merged)?;
		info!(path = %published.path.display(), nodes, edges, with_positions, "saved graph");
		Ok((SaveReport { path: published.path.clone(), nodes, edges }, published))
	}

	/// Drop nodes without a scene and every edge touching them.
	pub fn cleanup(&mut self, scene_ids: &HashSet<String>) -> StoreResult<(CleanupReport, Published)> {
		let current = match self.read_disk() {
			Some(g) => g,
			None if !self.graph.nodes.is_empty() => self.graph.clone(),
			None => return Err(StoreError::NotFound("no graph data found".into())),
		};
		let (kept, removed): (Vec<GraphNode>, Vec<GraphNode>) = current.nodes.into_iter().partition(|n| scene_ids.contains(&n.id));
		let valid: HashSet<&str> = kept.iter().map(|n| n.id.as_str()).collect();
		let edges: Vec<GraphEdge> = current.edges.into_iter().filter(|e| valid.contains(e.from.as_str()) && valid.contains(e.to.as_str())).collect();
		let report = CleanupReport {
			removed_count: removed.len(),
			removed_nodes: removed.into_iter().map(|n| n.id).collect(),
			remaining_nodes: kept.len(),
			remaining_edges: edges.len(),
		};
		let published = self.persist(Graph { nodes: kept, edges })?;
		info!(removed = report.removed_count, remaining = report.remaining_nodes, "cleaned graph");
		Ok((report, published))
	}
}
