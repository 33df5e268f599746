//! Ticket selection cart.
//!
//! One insertion-ordered map from ticket id to cart line. The list view and
//! quantities are derived from it, so the two can never disagree.

use crate::error::CartError;
use crate::types::{CartItem, Currency, Money, Ticket, TicketId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The buyer's ticket selection
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cart {
    lines: IndexMap<TicketId, CartItem>,
}

impl Cart {
    /// Empty cart
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of distinct ticket types
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// The line for `ticket_id`
    #[must_use]
    pub fn get(&self, ticket_id: &TicketId) -> Option<&CartItem> {
        self.lines.get(ticket_id)
    }

    /// Selected quantity of `ticket_id` (0 when absent)
    #[must_use]
    pub fn quantity_of(&self, ticket_id: &TicketId) -> u32 {
        self.lines.get(ticket_id).map_or(0, |item| item.quantity)
    }

    /// Lines in the order they were added
    pub fn items(&self) -> impl Iterator<Item = &CartItem> {
        self.lines.values()
    }

    /// Owned copy of the lines
    #[must_use]
    pub fn to_items(&self) -> Vec<CartItem> {
        self.lines.values().cloned().collect()
    }

    /// Currency of the cart (that of its first line)
    #[must_use]
    pub fn currency(&self) -> Option<&Currency> {
        self.lines.first().map(|(_, item)| &item.ticket.currency)
    }

    /// Adds `ticket` with quantity 1
    ///
    /// # Errors
    ///
    /// - [`CartError::AlreadyInCart`] if the ticket type already has a line
    /// - [`CartError::InsufficientInventory`] if none are left
    /// - [`CartError::CurrencyMismatch`] if the cart is priced in another currency
    pub fn add_to_cart(&mut self, ticket: Ticket) -> Result<(), CartError> {
        if self.lines.contains_key(&ticket.id) {
            return Err(CartError::AlreadyInCart { ticket_id: ticket.id });
        }
        if ticket.available == 0 {
            return Err(CartError::InsufficientInventory {
                ticket_id: ticket.id,
                requested: 1,
                available: 0,
            });
        }
        if let Some(expected) = self.currency() {
            if *expected != ticket.currency {
                return Err(CartError::CurrencyMismatch {
                    expected: expected.clone(),
                    found: ticket.currency,
                });
            }
        }

        self.lines
            .insert(ticket.id.clone(), CartItem { ticket, quantity: 1 });
        Ok(())
    }

    /// Sets the quantity of an existing line
    ///
    /// Negative quantities clamp to 0, and 0 removes the line (a no-op when
    /// the line is already gone).
    ///
    /// # Errors
    ///
    /// - [`CartError::NotInCart`] for a positive quantity on a missing line
    /// - [`CartError::InsufficientInventory`] above the ticket's inventory
    pub fn change_quantity(
        &mut self,
        ticket_id: &TicketId,
        new_quantity: i64,
    ) -> Result<(), CartError> {
        let Ok(requested) = u64::try_from(new_quantity) else {
            self.remove_from_cart(ticket_id);
            return Ok(());
        };
        if requested == 0 {
            self.remove_from_cart(ticket_id);
            return Ok(());
        }

        let item = self
            .lines
            .get_mut(ticket_id)
            .ok_or_else(|| CartError::NotInCart {
                ticket_id: ticket_id.clone(),
            })?;

        let available = item.ticket.available;
        match u32::try_from(requested) {
            Ok(quantity) if quantity <= available => {
                item.quantity = quantity;
                Ok(())
            },
            _ => Err(CartError::InsufficientInventory {
                ticket_id: ticket_id.clone(),
                requested,
                available,
            }),
        }
    }

    /// Removes a line, returning it if it was present
    pub fn remove_from_cart(&mut self, ticket_id: &TicketId) -> Option<CartItem> {
        self.lines.shift_remove(ticket_id)
    }

    /// Sum of price × quantity over all lines
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Overflow`] if the total does not fit.
    pub fn total(&self) -> Result<Money, CartError> {
        compute_total(self.lines.values())
    }

    /// Sum of quantities over all lines
    #[must_use]
    pub fn item_count(&self) -> u32 {
        compute_item_count(self.lines.values())
    }

    /// Removes every line
    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

impl FromIterator<CartItem> for Cart {
    fn from_iter<I: IntoIterator<Item = CartItem>>(iter: I) -> Self {
        Self {
            lines: iter
                .into_iter()
                .map(|item| (item.ticket.id.clone(), item))
                .collect(),
        }
    }
}

/// Sum of price × quantity
///
/// # Errors
///
/// Returns [`CartError::Overflow`] if the total does not fit.
pub fn compute_total<'a, I>(items: I) -> Result<Money, CartError>
where
    I: IntoIterator<Item = &'a CartItem>,
{
    items.into_iter().try_fold(Money::ZERO, |total, item| {
        item.line_total()
            .and_then(|line| total.checked_add(line))
            .ok_or(CartError::Overflow)
    })
}

/// Sum of quantities, saturating
pub fn compute_item_count<'a, I>(items: I) -> u32
where
    I: IntoIterator<Item = &'a CartItem>,
{
    items
        .into_iter()
        .fold(0u32, |count, item| count.saturating_add(item.quantity))
}
