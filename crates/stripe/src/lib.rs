pub mod client;
pub mod events;

pub use client::{CheckoutSession, CreateCheckoutSession, StripeClient, StripeError};
pub use events::{
    CheckoutSessionObject, Event, EventData, EventKind, InvoiceObject, SubscriptionObject,
};
