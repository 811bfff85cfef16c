//! Product catalog.
//!
//! Public reads under `/ext/products/catalog`; authenticated management
//! under `/ext/products/products`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension as RequestExtension, Json};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use hearth_core::extension::{
    AuthUser, Extension, ExtensionContext, ExtensionError, ExtensionMetadata, ExtensionRouter,
    ExtensionServices, HealthState, HealthStatus, Migration, Permission, Result, Row,
};

use crate::common::{invalid_config, ok, parse_config, require_services, timestamp};

pub const NAME: &str = "products";

const PRODUCT_COLUMNS: &str = "id, name, price_cents, currency, active, created_by, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProductsSettings {
    /// ISO 4217 code applied when a product does not name one.
    pub currency: String,
    pub max_price_cents: Option<i64>,
}

impl Default for ProductsSettings {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            max_price_cents: None,
        }
    }
}

fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}

#[derive(Clone)]
struct ProductsState {
    services: ExtensionServices,
    settings: Arc<RwLock<ProductsSettings>>,
}

impl ProductsState {
    fn check_price(&self, price_cents: i64) -> Result<()> {
        if price_cents < 0 {
            return Err(ExtensionError::InvalidInput("price_cents must not be negative".into()));
        }
        if let Some(max) = self.settings.read().max_price_cents {
            if price_cents > max {
                return Err(ExtensionError::InvalidInput(format!(
                    "price_cents exceeds the configured maximum of {}",
                    max
                )));
            }
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Row> {
        let sql = format!("SELECT {} FROM products WHERE id = ?", PRODUCT_COLUMNS);
        self.services
            .db()
            .query(&sql, &[json!(id)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ExtensionError::NotFound(format!("product {}", id)))
    }
}

pub struct ProductsExtension {
    metadata: ExtensionMetadata,
    settings: Arc<RwLock<ProductsSettings>>,
    services: Option<ExtensionServices>,
}

impl ProductsExtension {
    pub fn new() -> Self {
        Self {
            metadata: ExtensionMetadata::new(NAME, semver::Version::new(1, 0, 3))
                .with_description("Product catalog with authenticated management")
                .with_author("Hearth")
                .with_license("Apache-2.0")
                .with_tags(["commerce"]),
            settings: Arc::new(RwLock::new(ProductsSettings::default())),
            services: None,
        }
    }

    fn state(&self) -> Result<ProductsState> {
        Ok(ProductsState {
            services: require_services(NAME, &self.services)?.clone(),
            settings: self.settings.clone(),
        })
    }
}

impl Default for ProductsExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for ProductsExtension {
    fn metadata(&self) -> &ExtensionMetadata {
        &self.metadata
    }

    async fn initialize(&mut self, _ctx: &ExtensionContext, services: ExtensionServices) -> Result<()> {
        self.services = Some(services);
        Ok(())
    }

    async fn health(&self, _ctx: &ExtensionContext) -> Result<HealthStatus> {
        let Some(services) = &self.services else {
            return Ok(HealthStatus::new(HealthState::Unknown).with_message("not initialized"));
        };
        match services
            .db()
            .query("SELECT COUNT(*) AS total FROM products", &[])
            .await
        {
            Ok(rows) => {
                let total = rows
                    .first()
                    .and_then(|row| row.get("total").and_then(Value::as_i64))
                    .unwrap_or(0);
                Ok(HealthStatus::healthy().with_message(format!("{} products", total)))
            }
            Err(e) => Ok(HealthStatus::unhealthy(e.to_string())),
        }
    }

    fn register_routes(&self, router: &mut ExtensionRouter) -> Result<()> {
        let state = self.state()?;
        router
            .route("/catalog", get(catalog).with_state(state.clone()))
            .route_with_auth(
                "/products",
                get(list_products)
                    .post(create_product)
                    .with_state(state.clone()),
            )
            .route_with_auth(
                "/products/:id",
                get(get_product)
                    .put(update_product)
                    .delete(delete_product)
                    .with_state(state),
            );
        Ok(())
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "currency": { "type": "string", "pattern": "^[A-Z]{3}$", "default": "USD" },
                "max_price_cents": { "type": "integer", "minimum": 1 }
            },
            "additionalProperties": false
        })
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let settings: ProductsSettings = parse_config(NAME, config)?;
        if !is_currency_code(&settings.currency) {
            return Err(invalid_config(
                NAME,
                format!("currency {:?} is not a three-letter code", settings.currency),
            ));
        }
        if matches!(settings.max_price_cents, Some(max) if max < 1) {
            return Err(invalid_config(NAME, "max_price_cents must be positive"));
        }
        Ok(())
    }

    async fn apply_config(&mut self, config: &Value) -> Result<()> {
        *self.settings.write() = parse_config(NAME, config)?;
        Ok(())
    }

    fn migrations(&self) -> Vec<Migration> {
        vec![
            Migration::new(
                "1",
                "create products",
                r#"
                CREATE TABLE products (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    price_cents INTEGER NOT NULL,
                    currency TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_by TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                "#,
            )
            .with_down("DROP TABLE products;"),
            Migration::new(
                "2",
                "index active products",
                "CREATE INDEX idx_products_active ON products (active, name);",
            )
            .with_down("DROP INDEX idx_products_active;"),
        ]
    }

    fn required_permissions(&self) -> Vec<Permission> {
        vec![Permission::new("products.manage", "Create, edit and delete products")]
    }
}

// ============================================================================
// Handlers
// ============================================================================

type HandlerResult<T> = std::result::Result<T, ExtensionError>;

async fn catalog(State(state): State<ProductsState>) -> HandlerResult<Json<Value>> {
    let sql = format!(
        "SELECT {} FROM products WHERE active = 1 ORDER BY name",
        PRODUCT_COLUMNS
    );
    Ok(ok(state.services.db().query(&sql, &[]).await?))
}

async fn list_products(State(state): State<ProductsState>) -> HandlerResult<Json<Value>> {
    let sql = format!("SELECT {} FROM products ORDER BY created_at", PRODUCT_COLUMNS);
    Ok(ok(state.services.db().query(&sql, &[]).await?))
}

#[derive(Debug, Deserialize)]
struct NewProduct {
    name: String,
    price_cents: i64,
    currency: Option<String>,
}

async fn create_product(
    State(state): State<ProductsState>,
    RequestExtension(user): RequestExtension<AuthUser>,
    Json(input): Json<NewProduct>,
) -> HandlerResult<(StatusCode, Json<Value>)> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(ExtensionError::InvalidInput("name must not be empty".into()));
    }
    state.check_price(input.price_cents)?;
    let currency = match input.currency {
        Some(code) if is_currency_code(&code) => code,
        Some(code) => {
            return Err(ExtensionError::InvalidInput(format!(
                "currency {:?} is not a three-letter code",
                code
            )))
        }
        None => state.settings.read().currency.clone(),
    };

    let id = Uuid::new_v4().to_string();
    let now = timestamp();
    state
        .services
        .db()
        .exec(
            "INSERT INTO products (id, name, price_cents, currency, active, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?, ?)",
            &[
                json!(id),
                json!(name),
                json!(input.price_cents),
                json!(currency),
                json!(user.id),
                json!(now),
                json!(now),
            ],
        )
        .await?;
    state.services.stats().increment("created", 1);
    state
        .services
        .logger()
        .with_field("product", &id)
        .with_field("user", &user.id)
        .info("product created");

    Ok((StatusCode::CREATED, ok(state.find(&id).await?)))
}

async fn get_product(
    State(state): State<ProductsState>,
    Path(id): Path<String>,
) -> HandlerResult<Json<Value>> {
    Ok(ok(state.find(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ProductUpdate {
    name: Option<String>,
    price_cents: Option<i64>,
    active: Option<bool>,
}

async fn update_product(
    State(state): State<ProductsState>,
    Path(id): Path<String>,
    Json(update): Json<ProductUpdate>,
) -> HandlerResult<Json<Value>> {
    if let Some(price) = update.price_cents {
        state.check_price(price)?;
    }
    if matches!(&update.name, Some(name) if name.trim().is_empty()) {
        return Err(ExtensionError::InvalidInput("name must not be empty".into()));
    }

    let changed = state
        .services
        .db()
        .exec(
            "UPDATE products SET name = COALESCE(?, name), price_cents = COALESCE(?, price_cents), \
             active = COALESCE(?, active), updated_at = ? WHERE id = ?",
            &[
                json!(update.name.map(|n| n.trim().to_string())),
                json!(update.price_cents),
                json!(update.active),
                json!(timestamp()),
                json!(id),
            ],
        )
        .await?;
    if changed == 0 {
        return Err(ExtensionError::NotFound(format!("product {}", id)));
    }
    Ok(ok(state.find(&id).await?))
}

async fn delete_product(
    State(state): State<ProductsState>,
    Path(id): Path<String>,
) -> HandlerResult<StatusCode> {
    let removed = state
        .services
        .db()
        .exec("DELETE FROM products WHERE id = ?", &[json!(id)])
        .await?;
    if removed == 0 {
        return Err(ExtensionError::NotFound(format!("product {}", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_validation() {
        let ext = ProductsExtension::new();
        assert!(ext.validate_config(&json!({})).is_ok());
        assert!(ext.validate_config(&json!({ "currency": "EUR" })).is_ok());
        assert!(ext.validate_config(&json!({ "currency": "euro" })).is_err());
        assert!(ext.validate_config(&json!({ "currency": 978 })).is_err());
    }

    #[test]
    fn test_max_price_validation() {
        let ext = ProductsExtension::new();
        assert!(ext.validate_config(&json!({ "max_price_cents": 100 })).is_ok());
        assert!(ext.validate_config(&json!({ "max_price_cents": 0 })).is_err());
    }

    #[test]
    fn test_price_bounds() {
        let state = ProductsState {
            services: ExtensionServices::inert(NAME, NAME),
            settings: Arc::new(RwLock::new(ProductsSettings {
                currency: "USD".into(),
                max_price_cents: Some(1_000),
            })),
        };
        assert!(state.check_price(0).is_ok());
        assert!(state.check_price(1_000).is_ok());
        assert!(state.check_price(-1).is_err());
        assert!(state.check_price(1_001).is_err());
    }

    #[test]
    fn test_declares_permissions() {
        let perms = ProductsExtension::new().required_permissions();
        assert_eq!(perms[0].name, "products.manage");
    }
}
