//! Built-in Hearth extensions.
//!
//! Extensions are linked at build time. The host hands [`catalog`] to the
//! extension manager, which registers each entry and enables those marked
//! enabled in the persisted settings.
//!
//! | name | contributes |
//! |------|-------------|
//! | `analytics` | page-view table, request timer middleware, `/dashboard`, `/events` |
//! | `products` | product catalog table and CRUD routes |
//! | `cloud-storage` | upload, download and signed links over object storage |

pub mod analytics;
pub mod cloud_storage;
pub mod products;

mod common;

pub use analytics::AnalyticsExtension;
pub use cloud_storage::CloudStorageExtension;
pub use products::ProductsExtension;

use hearth_core::extension::Extension;

/// Names of the extensions returned by [`catalog`], in registration order.
pub const BUILTIN_EXTENSIONS: [&str; 3] = [analytics::NAME, products::NAME, cloud_storage::NAME];

/// Fresh instances of every built-in extension.
pub fn catalog() -> Vec<Box<dyn Extension>> {
    vec![
        Box::new(AnalyticsExtension::new()),
        Box::new(ProductsExtension::new()),
        Box::new(CloudStorageExtension::new()),
    ]
}
