use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use uuid::Uuid;

use limbic_core::time::MS_PER_DAY;
use limbic_core::{
    AffectVector, EntryPoint, GraphSource, Layer, MemoryNode, MemoryTurn, NodeMeta,
    RecallFilters, RecalledTurn, TurnId, TurnRecord,
};

use crate::error::{Result, StoreError};
use crate::schema;

/// Node columns needed to build a [`NodeMeta`], in [`meta_from_row`] order.
const META_COLUMNS: &str = "n.id, n.turn_id, n.layer, n.timestamp_ms, n.affect, n.novelty_score";

/// Snapshot for external monitoring.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub node_count: i64,
    pub edge_count: i64,
    pub turn_count: i64,
    pub layers: BTreeMap<String, i64>,
    /// Turns captured in the last 24 hours.
    pub recent_24h: i64,
    pub db_size_bytes: i64,
    pub fts_enabled: bool,
    pub first_memory_ms: Option<i64>,
    pub last_memory_ms: Option<i64>,
    pub avg_novelty: Option<f64>,
    pub embedding_count: i64,
    pub schema_version: Option<i64>,
}

/// SQLite-backed memory graph. One instance per connection; writes go
/// through [`crate::WriteQueue`], which owns the writing instance.
pub struct MemoryStore {
    conn: Connection,
}

impl MemoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, schema::DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Open (creating or migrating) the database at `path`.
    pub fn open_with(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize_with(&conn, busy_timeout_ms)?;
        Ok(Self { conn })
    }

    /// Open a second handle on an already initialized database for reads.
    pub fn open_reader(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::configure(&conn, busy_timeout_ms)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Writes ---

    /// Persist one turn: three nodes, three edges and the turn record in a
    /// single transaction. Nothing is visible unless all of it commits.
    pub fn write_turn(&self, record: &TurnRecord) -> Result<MemoryTurn> {
        let tx = self.conn.unchecked_transaction()?;
        let turn = self.write_turn_on(&tx, record)?;
        tx.commit()?;
        Ok(turn)
    }

    fn write_turn_on(&self, conn: &Connection, record: &TurnRecord) -> Result<MemoryTurn> {
        let affect = encode_affect(record.affect.as_ref())?;
        let mut ids: HashMap<Layer, Uuid> = HashMap::with_capacity(3);

        for layer in Layer::ALL {
            let id = Uuid::new_v4();
            let draft = record.layer(layer);
            conn.execute(
                "INSERT INTO memory_nodes (id, timestamp_ms, layer, text, summary, speaker, affect,
                                           turn_id, identity, conversation_id, session_id, novelty_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id.to_string(),
                    record.timestamp_ms,
                    layer.as_str(),
                    draft.text,
                    draft.summary,
                    draft.speaker,
                    affect,
                    record.turn_id.as_str(),
                    record.identity,
                    record.conversation_id,
                    record.session_id,
                    record.novelty_score,
                ],
            )?;
            ids.insert(layer, id);
        }

        let turn = MemoryTurn {
            turn_id: record.turn_id.clone(),
            input_node: ids[&Layer::Input],
            deliberation_node: Some(ids[&Layer::Deliberation]),
            output_node: ids[&Layer::Output],
            timestamp_ms: record.timestamp_ms,
            affect: record.affect,
        };
        for edge in turn.edges() {
            conn.execute(
                "INSERT INTO memory_edges (source, target, relation, weight) VALUES (?1, ?2, ?3, ?4)",
                params![
                    edge.source.to_string(),
                    edge.target.to_string(),
                    edge.relation.as_str(),
                    edge.weight,
                ],
            )?;
        }
        conn.execute(
            "INSERT INTO memory_turns (turn_id, input_node, deliberation_node, output_node,
                                       timestamp_ms, affect, novelty_score, identity, conversation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                turn.turn_id.as_str(),
                turn.input_node.to_string(),
                turn.deliberation_node.map(|id| id.to_string()),
                turn.output_node.to_string(),
                turn.timestamp_ms,
                affect,
                record.novelty_score,
                record.identity,
                record.conversation_id,
            ],
        )?;
        Ok(turn)
    }

    /// Store (or replace) the embedding of a turn as little-endian f32s.
    pub fn put_embedding(&self, turn_id: &TurnId, model: &str, vector: &[f32]) -> Result<()> {
        let blob: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        self.conn.execute(
            "INSERT OR REPLACE INTO memory_embeddings (turn_id, model, dims, vector)
             VALUES (?1, ?2, ?3, ?4)",
            params![turn_id.as_str(), model, vector.len() as i64, blob],
        )?;
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    // --- Entry points ---

    /// Nodes matching any of `terms`, scored by how many distinct terms they
    /// contain. Each term contributes at most `per_term_limit` newest rows.
    pub fn entry_points(
        &self,
        terms: &[String],
        filters: &RecallFilters,
        per_term_limit: usize,
    ) -> Result<Vec<EntryPoint>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {META_COLUMNS}
             FROM memory_fts JOIN memory_nodes n ON n.rowid = memory_fts.rowid
             WHERE memory_fts MATCH ?1
               AND (?2 IS NULL OR n.conversation_id = ?2)
               AND (?3 IS NULL OR n.speaker = ?3)
               AND (?4 IS NULL OR n.timestamp_ms >= ?4)
             ORDER BY n.timestamp_ms DESC
             LIMIT ?5"
        ))?;

        let mut found: HashMap<Uuid, EntryPoint> = HashMap::new();
        for term in terms {
            let rows: Vec<NodeMeta> = stmt
                .query_map(
                    params![
                        fts_phrase(term),
                        filters.conversation_id,
                        filters.speaker,
                        filters.since_ms,
                        per_term_limit as i64,
                    ],
                    meta_from_row,
                )?
                .collect::<std::result::Result<_, _>>()?;
            for node in rows {
                found
                    .entry(node.id)
                    .or_insert_with(|| EntryPoint { node, matches: 0 })
                    .matches += 1;
            }
        }
        Ok(found.into_values().collect())
    }

    // --- Reconstruction ---

    /// Full text of the given turns, in the order asked. Unknown ids are skipped.
    pub fn load_turns(&self, turn_ids: &[TurnId]) -> Result<Vec<RecalledTurn>> {
        if turn_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(turn_ids.len());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT t.turn_id, t.timestamp_ms, t.affect, t.novelty_score, n.layer, n.text, n.speaker
             FROM memory_turns t JOIN memory_nodes n ON n.turn_id = t.turn_id
             WHERE t.turn_id IN ({placeholders})"
        ))?;

        type Row7 = (String, i64, Option<String>, f64, String, String, String);
        let rows: Vec<Row7> = stmt
            .query_map(params_from_iter(turn_ids.iter().map(TurnId::as_str)), |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut turns: HashMap<TurnId, RecalledTurn> = HashMap::new();
        for (turn_id, timestamp_ms, affect, novelty_score, layer, text, speaker) in rows {
            let layer = parse_layer(&layer)?;
            let affect = decode_affect(affect.as_deref())?;
            let turn_id = TurnId::from(turn_id);
            let turn = turns.entry(turn_id.clone()).or_insert_with(|| RecalledTurn {
                turn_id,
                timestamp_ms,
                speaker: String::new(),
                input: String::new(),
                deliberation: String::new(),
                output: String::new(),
                affect,
                novelty_score,
                score: 0.0,
            });
            match layer {
                Layer::Input => {
                    turn.input = text;
                    turn.speaker = speaker;
                }
                Layer::Deliberation => turn.deliberation = text,
                Layer::Output => turn.output = text,
            }
        }

        Ok(turn_ids.iter().filter_map(|id| turns.remove(id)).collect())
    }

    pub fn get_turn(&self, turn_id: &TurnId) -> Result<Option<MemoryTurn>> {
        let row: Option<(String, String, Option<String>, String, i64, Option<String>)> = self
            .conn
            .query_row(
                "SELECT turn_id, input_node, deliberation_node, output_node, timestamp_ms, affect
                 FROM memory_turns WHERE turn_id = ?1",
                [turn_id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, input, deliberation, output, timestamp_ms, affect)) = row else {
            return Ok(None);
        };
        Ok(Some(MemoryTurn {
            turn_id: TurnId::from(id),
            input_node: parse_uuid(&input)?,
            deliberation_node: deliberation.as_deref().map(parse_uuid).transpose()?,
            output_node: parse_uuid(&output)?,
            timestamp_ms,
            affect: decode_affect(affect.as_deref())?,
        }))
    }

    pub fn turn_exists(&self, turn_id: &TurnId) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_turns WHERE turn_id = ?1",
            [turn_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Every node of a turn, input first.
    pub fn nodes_for_turn(&self, turn_id: &TurnId) -> Result<Vec<MemoryNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp_ms, layer, text, summary, speaker, affect, turn_id,
                    conversation_id, session_id, novelty_score
             FROM memory_nodes WHERE turn_id = ?1 ORDER BY rowid",
        )?;
        type NodeRow = (
            String,
            i64,
            String,
            String,
            String,
            String,
            Option<String>,
            String,
            Option<String>,
            Option<String>,
            f64,
        );
        let rows: Vec<NodeRow> = stmt
            .query_map([turn_id.as_str()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(
                |(id, ts, layer, text, summary, speaker, affect, turn, conv, session, novelty)| {
                    Ok(MemoryNode {
                        id: parse_uuid(&id)?,
                        timestamp_ms: ts,
                        layer: parse_layer(&layer)?,
                        text,
                        summary,
                        speaker,
                        affect: decode_affect(affect.as_deref())?,
                        turn_id: TurnId::from(turn),
                        conversation_id: conv,
                        session_id: session,
                        novelty_score: novelty,
                    })
                },
            )
            .collect()
    }

    /// Stored embeddings for the given turns, skipping any whose model differs.
    pub fn embeddings(&self, turn_ids: &[TurnId], model: &str) -> Result<HashMap<TurnId, Vec<f32>>> {
        if turn_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT turn_id, dims, vector FROM memory_embeddings
             WHERE model = ?1 AND turn_id IN ({})",
            placeholders_from(2, turn_ids.len())
        ))?;
        let args = std::iter::once(model).chain(turn_ids.iter().map(TurnId::as_str));
        let rows: Vec<(String, i64, Vec<u8>)> = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut out = HashMap::with_capacity(rows.len());
        for (turn_id, dims, blob) in rows {
            if blob.len() != dims as usize * 4 {
                return Err(StoreError::InvalidData(format!(
                    "embedding for {turn_id} has {} bytes, expected {}",
                    blob.len(),
                    dims * 4
                )));
            }
            let vector = blob
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            out.insert(TurnId::from(turn_id), vector);
        }
        Ok(out)
    }

    // --- Health ---

    pub fn health(&self, now_ms: i64) -> Result<HealthReport> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |row| row.get(0))?) };

        let mut layers = BTreeMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT layer, COUNT(*) FROM memory_nodes GROUP BY layer")?;
            let rows: Vec<(String, i64)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?;
            for (layer, n) in rows {
                // Legacy names fold into their current layer
                let name = Layer::parse(&layer).map_or(layer, |l| l.as_str().to_string());
                *layers.entry(name).or_insert(0) += n;
            }
        }

        let (first_memory_ms, last_memory_ms, avg_novelty): (Option<i64>, Option<i64>, Option<f64>) =
            self.conn.query_row(
                "SELECT MIN(timestamp_ms), MAX(timestamp_ms), AVG(novelty_score) FROM memory_turns",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        let recent_24h: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_turns WHERE timestamp_ms >= ?1",
            [now_ms - MS_PER_DAY],
            |row| row.get(0),
        )?;

        let page_count = count("PRAGMA page_count")?;
        let page_size = count("PRAGMA page_size")?;

        Ok(HealthReport {
            node_count: count("SELECT COUNT(*) FROM memory_nodes")?,
            edge_count: count("SELECT COUNT(*) FROM memory_edges")?,
            turn_count: count("SELECT COUNT(*) FROM memory_turns")?,
            layers,
            recent_24h,
            db_size_bytes: page_count * page_size,
            fts_enabled: schema::fts_enabled(&self.conn)?,
            first_memory_ms,
            last_memory_ms,
            avg_novelty,
            embedding_count: count("SELECT COUNT(*) FROM memory_embeddings")?,
            schema_version: schema::get_schema_version(&self.conn)?,
        })
    }
}

impl GraphSource for MemoryStore {
    type Error = StoreError;

    /// One query per BFS layer: neighbours along outgoing and incoming edges.
    fn expand(&self, frontier: &[Uuid]) -> Result<Vec<(Uuid, NodeMeta)>> {
        if frontier.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(frontier.len());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT e.source, {META_COLUMNS}
             FROM memory_edges e JOIN memory_nodes n ON n.id = e.target
             WHERE e.source IN ({placeholders})
             UNION ALL
             SELECT e.target, {META_COLUMNS}
             FROM memory_edges e JOIN memory_nodes n ON n.id = e.source
             WHERE e.target IN ({placeholders})"
        ))?;
        let ids: Vec<String> = frontier.iter().map(Uuid::to_string).collect();

        let rows: Vec<(String, NodeMeta)> = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                let from: String = row.get(0)?;
                Ok((from, meta_at(row, 1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(from, meta)| Ok((parse_uuid(&from)?, meta)))
            .collect()
    }
}

// --- Row helpers ---

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<NodeMeta> {
    meta_at(row, 0)
}

/// Decode [`META_COLUMNS`] starting at column `i`.
fn meta_at(row: &Row<'_>, i: usize) -> rusqlite::Result<NodeMeta> {
    let id: String = row.get(i)?;
    let layer: String = row.get(i + 2)?;
    let affect: Option<String> = row.get(i + 4)?;
    let conversion = |e: StoreError| {
        rusqlite::Error::FromSqlConversionFailure(i, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(NodeMeta {
        id: parse_uuid(&id).map_err(conversion)?,
        turn_id: TurnId::from(row.get::<_, String>(i + 1)?),
        layer: parse_layer(&layer).map_err(conversion)?,
        timestamp_ms: row.get(i + 3)?,
        affect: decode_affect(affect.as_deref()).map_err(conversion)?,
        novelty_score: row.get(i + 5)?,
    })
}

/// Quote a term as an FTS5 phrase so punctuation is not parsed as syntax.
fn fts_phrase(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn placeholders(n: usize) -> String {
    placeholders_from(1, n)
}

fn placeholders_from(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn encode_affect(affect: Option<&AffectVector>) -> Result<Option<String>> {
    Ok(affect.map(serde_json::to_string).transpose()?)
}

fn decode_affect(raw: Option<&str>) -> Result<Option<AffectVector>> {
    Ok(raw.map(serde_json::from_str).transpose()?)
}

fn parse_layer(s: &str) -> Result<Layer> {
    Layer::parse(s).ok_or_else(|| StoreError::InvalidData(format!("unknown layer: {s}")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}
