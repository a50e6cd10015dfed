// descriptor.rs - Agent Descriptor Documents
//
//! The descriptor is the persisted document that identifies and
//! parameterizes one agent. Revisions advance on every save; `instance_id`
//! is bumped by every agency that restarts the agent and fences off split
//! brain: a change notification that is not our own write means another
//! instance has taken over.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::database::{DatabaseError, Document};
use crate::messaging::Recipient;

/// Descriptor errors
#[derive(Debug, Clone, Error)]
pub enum DescriptorError {
    #[error("Descriptor body does not parse: {0}")]
    Malformed(String),

    #[error("Unknown allocation: {0}")]
    UnknownAllocation(String),

    #[error("Allocation is not preallocated: {0}")]
    NotPreallocated(String),

    #[error("Allocation of zero is not allowed")]
    EmptyAllocation,

    #[error("Allocating {requested} of {resource} exceeds capacity {capacity}")]
    OverAllocation {
        resource: String,
        requested: u64,
        capacity: u64,
    },
}

/// Lifecycle of a resource allocation.
///
/// A preallocation is a temporary reservation: it either gets confirmed
/// into `Allocated` or expires on its own. `Expired` and `Released` only
/// appear on receipts; entries in those states are removed from the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Preallocated,
    #[default]
    Allocated,
    Expired,
    Released,
}

/// One resource allocation held by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub resource: String,
    pub value: u64,

    #[serde(default)]
    pub state: AllocationState,

    /// Deadline of an unconfirmed preallocation, millis since epoch
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl Allocation {
    pub fn new(resource: impl Into<String>, value: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource: resource.into(),
            value,
            state: AllocationState::Allocated,
            expires_at: None,
        }
    }

    fn preallocated(resource: impl Into<String>, value: u64, expires_at: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource: resource.into(),
            value,
            state: AllocationState::Preallocated,
            expires_at,
        }
    }
}

/// A partnership entry: the peer's address, our role towards it and the
/// allocation backing it, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    pub recipient: Recipient,
    pub role: Option<String>,
    pub allocation_id: Option<String>,
}

/// The persisted agent identity document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Stable document id; doubles as the agent's messaging key
    pub doc_id: String,

    /// Opaque revision token of the last read/save
    pub rev: Option<String>,

    /// Agent type tag resolved through the factory registry
    pub document_type: String,

    /// Bumped by every restarting agency; the split-brain fence
    pub instance_id: u64,

    /// Messaging shard the agent lives in
    pub shard: String,

    #[serde(default)]
    pub allocations: Vec<Allocation>,

    #[serde(default)]
    pub partners: Vec<Partner>,

    /// Set while a restart is being orchestrated for this agent
    #[serde(default)]
    pub under_restart: bool,

    /// Type-specific extension content
    #[serde(default)]
    pub extension: Value,
}

impl Descriptor {
    pub fn new(
        document_type: impl Into<String>,
        doc_id: impl Into<String>,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev: None,
            document_type: document_type.into(),
            instance_id: 0,
            shard: shard.into(),
            allocations: Vec::new(),
            partners: Vec::new(),
            under_restart: false,
            extension: Value::Null,
        }
    }

    /// Messaging address of this agent.
    pub fn recipient(&self) -> Recipient {
        Recipient::agent(self.doc_id.clone(), self.shard.clone())
    }

    /// `doc_id/instance_id`, unique per live instance cluster-wide.
    pub fn full_id(&self) -> String {
        format!("{}/{}", self.doc_id, self.instance_id)
    }

    /// Convert into the database document envelope.
    pub fn to_document(&self) -> Result<Document, DatabaseError> {
        let body = serde_json::to_value(self)
            .map_err(|e| DatabaseError::Backend(e.to_string()))?;
        Ok(Document {
            id: self.doc_id.clone(),
            rev: self.rev.clone(),
            document_type: self.document_type.clone(),
            body,
        })
    }

    /// Parse a descriptor back out of a document envelope. The envelope's
    /// revision is authoritative.
    pub fn from_document(doc: &Document) -> Result<Self, DescriptorError> {
        let mut descriptor: Descriptor = serde_json::from_value(doc.body.clone())
            .map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        descriptor.doc_id = doc.id.clone();
        descriptor.rev = doc.rev.clone();
        descriptor.document_type = doc.document_type.clone();
        Ok(descriptor)
    }

    /// Sum of allocations of one resource. Preallocations reserve capacity
    /// just like confirmed allocations.
    pub fn total_allocated(&self, resource: &str) -> u64 {
        self.allocations
            .iter()
            .filter(|a| a.resource == resource)
            .map(|a| a.value)
            .sum()
    }

    fn check_capacity(
        &self,
        resource: &str,
        value: u64,
        capacity: u64,
    ) -> Result<(), DescriptorError> {
        if value == 0 {
            return Err(DescriptorError::EmptyAllocation);
        }
        let requested = self.total_allocated(resource) + value;
        if requested > capacity {
            return Err(DescriptorError::OverAllocation {
                resource: resource.to_string(),
                requested,
                capacity,
            });
        }
        Ok(())
    }

    /// Record an allocation directly, confirmed from the start.
    pub fn allocate(
        &mut self,
        resource: &str,
        value: u64,
        capacity: u64,
    ) -> Result<Allocation, DescriptorError> {
        self.check_capacity(resource, value, capacity)?;
        let allocation = Allocation::new(resource, value);
        self.allocations.push(allocation.clone());
        Ok(allocation)
    }

    /// Reserve capacity without committing to it. The reservation holds
    /// capacity like a confirmed allocation until it is confirmed, released
    /// or expired; the caller owns the expiry timer.
    pub fn preallocate(
        &mut self,
        resource: &str,
        value: u64,
        capacity: u64,
        expires_at: Option<i64>,
    ) -> Result<Allocation, DescriptorError> {
        self.check_capacity(resource, value, capacity)?;
        let allocation = Allocation::preallocated(resource, value, expires_at);
        self.allocations.push(allocation.clone());
        Ok(allocation)
    }

    /// Promote a preallocation into a confirmed allocation.
    pub fn confirm(&mut self, allocation_id: &str) -> Result<(), DescriptorError> {
        let allocation = self
            .allocations
            .iter_mut()
            .find(|a| a.id == allocation_id)
            .ok_or_else(|| DescriptorError::UnknownAllocation(allocation_id.to_string()))?;
        if allocation.state != AllocationState::Preallocated {
            return Err(DescriptorError::NotPreallocated(allocation_id.to_string()));
        }
        allocation.state = AllocationState::Allocated;
        allocation.expires_at = None;
        Ok(())
    }

    /// Drop a reservation that was never confirmed. Confirmed allocations
    /// are refused, which makes a late expiry timer a no-op.
    pub fn expire(&mut self, allocation_id: &str) -> Result<Allocation, DescriptorError> {
        let index = self
            .allocations
            .iter()
            .position(|a| a.id == allocation_id)
            .ok_or_else(|| DescriptorError::UnknownAllocation(allocation_id.to_string()))?;
        if self.allocations[index].state != AllocationState::Preallocated {
            return Err(DescriptorError::NotPreallocated(allocation_id.to_string()));
        }
        let mut allocation = self.allocations.remove(index);
        allocation.state = AllocationState::Expired;
        self.partners
            .retain(|p| p.allocation_id.as_deref() != Some(allocation_id));
        Ok(allocation)
    }

    /// Release an allocation in any live state, together with any partner
    /// entry backed by it.
    pub fn release(&mut self, allocation_id: &str) -> Result<Allocation, DescriptorError> {
        let index = self
            .allocations
            .iter()
            .position(|a| a.id == allocation_id)
            .ok_or_else(|| DescriptorError::UnknownAllocation(allocation_id.to_string()))?;
        let mut allocation = self.allocations.remove(index);
        allocation.state = AllocationState::Released;
        self.partners
            .retain(|p| p.allocation_id.as_deref() != Some(allocation_id));
        Ok(allocation)
    }

    pub fn add_partner(&mut self, partner: Partner) {
        let exists = self
            .partners
            .iter()
            .any(|p| p.recipient == partner.recipient);
        if !exists {
            self.partners.push(partner);
        }
    }

    pub fn remove_partner(&mut self, recipient: &Recipient) -> Option<Partner> {
        let index = self.partners.iter().position(|p| &p.recipient == recipient)?;
        Some(self.partners.remove(index))
    }
}
