//! Store running the checkout flow.

use crate::flow::{CheckoutEnvironment, CheckoutFlowReducer, CheckoutFlowState, FlowAction};
use boxoffice_runtime::Store;

/// Store driving one buyer's checkout
pub type CheckoutStore =
    Store<CheckoutFlowState, FlowAction, CheckoutEnvironment, CheckoutFlowReducer>;

/// Store starting on the event page, before tickets are requested
#[must_use]
pub fn checkout_store(environment: CheckoutEnvironment) -> CheckoutStore {
    Store::new(CheckoutFlowState::new(), CheckoutFlowReducer::new(), environment)
}
