//! Drag gesture to store mutation policy.
//!
//! Cards dragged into another list move eagerly on `drag_over` so the drop target
//! updates while the pointer is still down. Reordering inside one scope (cards in
//! their own list, lists on the board) is resolved once, on `drag_end`. A card
//! that already changed lists during the gesture keeps the slot it was previewed in.

use shared::domain::{Card, CardId, List, ListId};
use tracing::{debug, trace};

use crate::store::{MutationTicket, OrderingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    List,
    Card,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragState {
    Idle,
    Dragging { item_id: String, kind: ItemKind },
}

#[derive(Debug)]
pub enum DragOutcome {
    NoOp,
    CardMoved {
        card_id: CardId,
        list_id: ListId,
        order: i64,
        ticket: MutationTicket,
    },
    CardsReranked(Vec<MutationTicket>),
    ListsReranked(Vec<MutationTicket>),
}

impl DragOutcome {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    pub fn into_tickets(self) -> Vec<MutationTicket> {
        match self {
            Self::NoOp => Vec::new(),
            Self::CardMoved { ticket, .. } => vec![ticket],
            Self::CardsReranked(tickets) | Self::ListsReranked(tickets) => tickets,
        }
    }
}

enum DropTarget {
    Card(Card),
    List(List),
}

pub struct DragReorderController {
    store: OrderingStore,
    state: DragState,
    /// List the dragged card was in at `drag_start`.
    origin_list: Option<ListId>,
}

impl DragReorderController {
    pub fn new(store: OrderingStore) -> Self {
        Self {
            store,
            state: DragState::Idle,
            origin_list: None,
        }
    }

    pub fn state(&self) -> &DragState {
        &self.state
    }

    pub fn drag_start(&mut self, item_id: &str, kind: ItemKind) {
        if let DragState::Dragging { item_id: previous, .. } = &self.state {
            debug!(%previous, next = item_id, "drag: new drag replaced an unfinished one");
        }
        self.origin_list = match kind {
            ItemKind::Card => self.store.card(&CardId::from(item_id)).map(|card| card.list_id),
            ItemKind::List => None,
        };
        self.state = DragState::Dragging {
            item_id: item_id.to_string(),
            kind,
        };
    }

    /// Issues at most one store mutation.
    pub fn drag_over(&mut self, active_id: &str, over_id: &str) -> DragOutcome {
        if active_id == over_id {
            return DragOutcome::NoOp;
        }
        match self.active_kind(active_id) {
            Some(ItemKind::Card) => self.move_card_across(active_id, over_id),
            Some(ItemKind::List) | None => DragOutcome::NoOp,
        }
    }

    /// Always returns the controller to `Idle`, whether or not anything moved.
    pub fn drag_end(&mut self, active_id: &str, over_id: Option<&str>) -> DragOutcome {
        let kind = self.active_kind(active_id);
        let origin_list = match &self.state {
            DragState::Dragging { item_id, .. } if item_id == active_id => self.origin_list.take(),
            _ => None,
        };
        self.origin_list = None;
        self.state = DragState::Idle;

        let Some(over_id) = over_id else {
            return DragOutcome::NoOp;
        };
        if active_id == over_id {
            return DragOutcome::NoOp;
        }

        match kind {
            Some(ItemKind::Card) => {
                let outcome = self.move_card_across(active_id, over_id);
                if !outcome.is_noop() {
                    return outcome;
                }
                if self.left_origin_list(active_id, origin_list.as_ref()) {
                    debug!(active_id, over_id, "drag: card already placed in its new list");
                    return DragOutcome::NoOp;
                }
                self.reorder_card_in_list(active_id, over_id)
            }
            Some(ItemKind::List) => self.reorder_list(active_id, over_id),
            None => DragOutcome::NoOp,
        }
    }

    fn active_kind(&self, active_id: &str) -> Option<ItemKind> {
        if let DragState::Dragging { item_id, kind } = &self.state {
            if item_id == active_id {
                return Some(*kind);
            }
        }
        if self.store.card(&CardId::from(active_id)).is_some() {
            Some(ItemKind::Card)
        } else if self.store.list(&ListId::from(active_id)).is_some() {
            Some(ItemKind::List)
        } else {
            trace!(active_id, "drag: active item is not on this board");
            None
        }
    }

    fn left_origin_list(&self, active_id: &str, origin_list: Option<&ListId>) -> bool {
        let Some(origin_list) = origin_list else {
            return false;
        };
        self.store
            .card(&CardId::from(active_id))
            .is_some_and(|card| &card.list_id != origin_list)
    }

    fn resolve_target(&self, over_id: &str) -> Option<DropTarget> {
        if let Some(card) = self.store.card(&CardId::from(over_id)) {
            return Some(DropTarget::Card(card));
        }
        self.store.list(&ListId::from(over_id)).map(DropTarget::List)
    }

    /// Card over a card in another list takes that card's rank; card over another
    /// list's empty area is appended.
    fn move_card_across(&self, active_id: &str, over_id: &str) -> DragOutcome {
        let card_id = CardId::from(active_id);
        let Some(active) = self.store.card(&card_id) else {
            return DragOutcome::NoOp;
        };
        let (list_id, order) = match self.resolve_target(over_id) {
            Some(DropTarget::Card(over)) if over.list_id != active.list_id => {
                (over.list_id, over.order)
            }
            Some(DropTarget::List(list)) if list.id != active.list_id => {
                let order = self.store.card_count(&list.id) as i64;
                (list.id, order)
            }
            _ => return DragOutcome::NoOp,
        };

        debug!(%card_id, %list_id, order, "drag: moving card to another list");
        match self.store.move_card(&card_id, &list_id, order) {
            Some(ticket) => DragOutcome::CardMoved {
                card_id,
                list_id,
                order,
                ticket,
            },
            None => DragOutcome::NoOp,
        }
    }

    fn reorder_card_in_list(&self, active_id: &str, over_id: &str) -> DragOutcome {
        let tickets = self
            .store
            .reorder_card(&CardId::from(active_id), &CardId::from(over_id));
        if tickets.is_empty() {
            DragOutcome::NoOp
        } else {
            DragOutcome::CardsReranked(tickets)
        }
    }

    fn reorder_list(&self, active_id: &str, over_id: &str) -> DragOutcome {
        let over_list = match self.resolve_target(over_id) {
            Some(DropTarget::List(list)) => list.id,
            Some(DropTarget::Card(card)) => card.list_id,
            None => return DragOutcome::NoOp,
        };
        let tickets = self
            .store
            .reorder_list(&ListId::from(active_id), &over_list);
        if tickets.is_empty() {
            DragOutcome::NoOp
        } else {
            DragOutcome::ListsReranked(tickets)
        }
    }
}

#[cfg(test)]
#[path = "tests/drag_tests.rs"]
mod tests;
