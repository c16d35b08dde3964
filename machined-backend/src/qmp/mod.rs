mod client;
mod codec;
mod models;

pub use client::QmpClient;
pub use codec::QmpCodec;
pub use models::{QmpCommand, QmpError, QmpEvent, QmpGreeting, QmpResponse, QmpVersion};
