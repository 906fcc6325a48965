//! Output generation.
//!
//! # Submodules
//!
//! - [`json`]: Writes the ordered snapshot entries for the renderer
//!
//! Page templates and site layout belong to the renderer; this crate only
//! hands over `snapshot.json` and the localized images next to it.

pub mod json;
