//! # pagereel-cdp
//!
//! Thin Chrome DevTools Protocol client over `tokio-tungstenite`.
//!
//! Only the commands the recorder needs are implemented: launching or
//! connecting to Chrome, opening a page, screencast control and target
//! lifecycle notifications. [`CdpPage`] implements
//! [`pagereel_core::ScreencastPage`].

#![deny(unsafe_code)]

pub mod chrome;
pub mod error;
pub mod page;
pub mod protocol;
pub mod session;

pub use chrome::{ChromeOrigin, ChromeSearch, resolve_chrome};
pub use error::BrowserError;
pub use page::CdpPage;
pub use session::{BrowserSession, LaunchOptions};
