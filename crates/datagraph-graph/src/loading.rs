//! Lazy relationship loading: request tokens and the transport seam.

use crate::graph::Graph;
use async_trait::async_trait;
use datagraph_core::{
    Identifier, RecordStateLookup, RelationshipPayload, ResourceDocument, ResourceRef, Result,
};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    /// Follow the relationship's related link.
    Link(String),
    /// Fetch these members individually.
    Records(Vec<ResourceRef>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub owner: ResourceRef,
    pub field: String,
    pub target: FetchTarget,
}

/// What the transport hands back for a relationship fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRelationship {
    pub relationship: RelationshipPayload,
    pub included: Vec<ResourceDocument>,
}

#[async_trait]
pub trait RelationshipFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchedRelationship>;
}

/// A started load. Only the most recent ticket for an edge may apply its
/// result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub owner: Identifier,
    pub field: String,
    pub token: u64,
    pub request: FetchRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadDecision {
    /// Current data is usable as-is.
    Ready,
    /// A previous attempt failed; nothing is fetched until a forced reload.
    Suppressed,
    Fetch(LoadTicket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadCompletion {
    Applied,
    Failed,
    /// A newer request or a local edit superseded this ticket.
    Stale,
}

impl Graph {
    /// Decides whether accessing `owner.field` needs a fetch and, if so,
    /// issues a fresh ticket that invalidates older ones.
    pub fn begin_load(
        &mut self,
        owner: &Identifier,
        field: &str,
        force: bool,
        state: &dyn RecordStateLookup,
    ) -> Result<LoadDecision> {
        let edge = self.edge_mut(owner, field)?;
        if edge.is_implicit() {
            return Ok(LoadDecision::Ready);
        }
        let force = force || edge.state.should_force_reload;
        let members = edge.current_members();

        let target = if force {
            match edge.link.clone() {
                Some(link) => Some(FetchTarget::Link(link)),
                None if !members.is_empty() => {
                    Some(FetchTarget::Records(members.iter().map(Identifier::to_ref).collect()))
                }
                None => None,
            }
        } else if edge.state.has_failed_load_attempt {
            return Ok(LoadDecision::Suppressed);
        } else if edge.link.is_some()
            && (edge.state.is_stale
                || !edge.state.has_received_data
                || edge.state.has_dematerialized_inverse)
        {
            edge.link.clone().map(FetchTarget::Link)
        } else {
            let missing: Vec<ResourceRef> = members
                .iter()
                .filter(|m| state.is_empty(m) && !state.is_new(m))
                .map(Identifier::to_ref)
                .collect();
            (!missing.is_empty()).then_some(FetchTarget::Records(missing))
        };

        let Some(target) = target else {
            return Ok(LoadDecision::Ready);
        };
        edge.load_generation += 1;
        let token = edge.load_generation;
        edge.pending_load = Some(token);
        edge.state.should_force_reload = false;
        debug!("Loading {}.{} (token {}) via {:?}", owner, field, token, target);
        Ok(LoadDecision::Fetch(LoadTicket {
            owner: owner.clone(),
            field: field.to_string(),
            token,
            request: FetchRequest {
                owner: owner.to_ref(),
                field: field.to_string(),
                target,
            },
        }))
    }

    pub fn is_current_load(&self, ticket: &LoadTicket) -> bool {
        self.edge(&ticket.owner, &ticket.field)
            .is_some_and(|edge| edge.pending_load == Some(ticket.token))
    }

    /// Consumes the ticket. Stale tickets change nothing.
    pub fn finish_load(&mut self, ticket: &LoadTicket, succeeded: bool) -> LoadCompletion {
        if !self.is_current_load(ticket) {
            trace!("stale load token {} for {}.{}", ticket.token, ticket.owner, ticket.field);
            return LoadCompletion::Stale;
        }
        let Some(edge) = self.edge_existing_mut(&ticket.owner, &ticket.field) else {
            return LoadCompletion::Stale;
        };
        edge.pending_load = None;
        if succeeded {
            edge.state.has_failed_load_attempt = false;
            edge.state.is_stale = false;
            edge.state.has_dematerialized_inverse = false;
            LoadCompletion::Applied
        } else {
            edge.state.has_failed_load_attempt = true;
            LoadCompletion::Failed
        }
    }

    /// Makes the next access refetch regardless of earlier failures.
    pub fn force_reload(&mut self, owner: &Identifier, field: &str) -> Result<()> {
        self.edge_mut(owner, field)?.state.should_force_reload = true;
        Ok(())
    }
}
