//! Generated node documents: an ordered list of typed content blocks.
//!
//! Documents are produced by the content-generation pipeline and consumed
//! read-only here. The planner only looks at block identity, kind, concept
//! annotations, citations, and explicit trigger ordering; everything else
//! in a block stays opaque.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::ids::{BlockId, ConceptId, NodeId};

/// Kind discriminant of a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Section heading
    Heading,
    /// Prose paragraph
    Paragraph,
    /// Call-out box
    Callout,
    /// Inline quick-check question
    QuickCheck,
    /// Flashcard review card
    Flashcard,
    /// Figure with caption
    Figure,
    /// Generated diagram
    Diagram,
    /// Data table
    Table,
    /// Display equation
    Equation,
    /// Code listing
    Code,
    /// Unrecognized kind; treated as teaching content
    #[serde(other)]
    Other,
}

impl BlockKind {
    /// Whether blocks of this kind can be surfaced as a runtime prompt.
    pub fn is_promptable(&self) -> bool {
        matches!(self, Self::QuickCheck | Self::Flashcard)
    }

    /// Teaching content: anything the learner reads rather than answers.
    pub fn is_teaching(&self) -> bool {
        !self.is_promptable()
    }
}

/// A citation attached to a block, pointing at a source chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Citation {
    /// Source chunk backing the cited span
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    /// Remaining citation fields, untouched
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// One typed content block inside a node document.
///
/// The planner reads `id`, `kind`, `concept_keys`, `concept_ids`,
/// `citations`, and `trigger_after_block_ids`; the `body` map carries the
/// kind-specific content fields verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block id, unique within the document
    pub id: BlockId,
    /// Kind discriminant
    #[serde(rename = "type")]
    pub kind: BlockKind,
    /// Concept keys this block teaches or assesses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concept_keys: Vec<String>,
    /// Resolved concept ids, when generation attached them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concept_ids: Vec<ConceptId>,
    /// Source citations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    /// Blocks that must be read before this one may trigger
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger_after_block_ids: Vec<BlockId>,
    /// Kind-specific content, opaque to the engine
    #[serde(flatten)]
    pub body: HashMap<String, Value>,
}

impl Block {
    /// Create a bare block of the given kind.
    pub fn new(id: impl Into<BlockId>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            kind,
            concept_keys: Vec::new(),
            concept_ids: Vec::new(),
            citations: Vec::new(),
            trigger_after_block_ids: Vec::new(),
            body: HashMap::new(),
        }
    }

    /// Attach concept keys.
    pub fn with_concept_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.concept_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a citation by chunk id.
    pub fn with_citation(mut self, chunk_id: impl Into<String>) -> Self {
        self.citations.push(Citation {
            chunk_id: Some(chunk_id.into()),
            extra: HashMap::new(),
        });
        self
    }

    /// Attach explicit trigger ordering.
    pub fn with_trigger_after<I, B>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<BlockId>,
    {
        self.trigger_after_block_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Chunk ids cited by this block.
    pub fn citation_chunk_ids(&self) -> BTreeSet<&str> {
        self.citations
            .iter()
            .filter_map(|c| c.chunk_id.as_deref())
            .collect()
    }

    /// Whether this block shares at least one cited chunk with `other`.
    pub fn shares_citation_with(&self, other: &Block) -> bool {
        let mine = self.citation_chunk_ids();
        if mine.is_empty() {
            return false;
        }
        other
            .citation_chunk_ids()
            .iter()
            .any(|chunk| mine.contains(chunk))
    }
}

/// A generated node document: ordered blocks plus document-level concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    /// Node this document belongs to
    pub node_id: NodeId,
    /// Document-level concept keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concept_keys: Vec<String>,
    /// Ordered content blocks
    pub blocks: Vec<Block>,
}

impl NodeDocument {
    /// Create a document for a node.
    pub fn new(node_id: NodeId, blocks: Vec<Block>) -> Self {
        Self {
            node_id,
            concept_keys: Vec::new(),
            blocks,
        }
    }

    /// Set document-level concept keys.
    pub fn with_concept_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.concept_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Index of a block by id.
    pub fn index_of(&self, id: &BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == *id)
    }

    /// Block lookup by id.
    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == *id)
    }

    /// All concept keys in the document: document-level plus per-block,
    /// deduplicated and sorted.
    pub fn all_concept_keys(&self, include_block_keys: bool) -> Vec<String> {
        let mut keys: BTreeSet<String> = self.concept_keys.iter().cloned().collect();
        if include_block_keys {
            for block in &self.blocks {
                keys.extend(block.concept_keys.iter().cloned());
            }
        }
        keys.into_iter().collect()
    }

    /// Promptable blocks (quick-checks and flashcards) with their indices.
    pub fn promptable_blocks(&self) -> impl Iterator<Item = (usize, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.kind.is_promptable())
    }
}
