use serde_json::json;
use singletable::{to_properties, MemoryStore, Params, SingleTableError, Table, TableOptions};
use std::path::PathBuf;
use std::sync::Arc;

const SCHEMA: &str = include_str!("../schema.yaml");

#[tokio::main]
async fn main() -> Result<(), SingleTableError> {
    env_logger::init();

    let schema = match std::env::var("SINGLETABLE_SCHEMA") {
        Ok(path) => {
            log::info!("Loading schema from: {path}");
            singletable::parse_schema(&PathBuf::from(path))?
        }
        Err(_) => singletable::parse_schema_str(SCHEMA)?,
    };
    let table_name = std::env::var("SINGLETABLE_TABLE").unwrap_or_else(|_| "Example".to_string());
    let store = Arc::new(MemoryStore::new(&schema.indexes));
    let table = Table::new(schema, TableOptions::new(table_name, store.clone()))?;
    log::info!("Models: {}", table.model_names().collect::<Vec<_>>().join(", "));

    let users = table.model("User")?;
    let orders = table.model("Order")?;

    let user = users
        .create(
            to_properties(json!({"id": 1, "name": "Ann", "email": "ann@example.com"})),
            Params::new(),
        )
        .await?
        .into_item();
    println!("created {user:?}");

    match users
        .create(
            to_properties(json!({"id": 2, "name": "Bob", "email": "ann@example.com"})),
            Params::new(),
        )
        .await
    {
        Err(err) => println!("{}: {err}", err.code()),
        Ok(_) => log::warn!("Duplicate email was accepted"),
    }

    for (day, n, total) in [("2024-01-01", 1, 12.5), ("2024-01-01", 2, 8.0), ("2024-01-02", 1, 30.0)] {
        orders
            .create(
                to_properties(json!({"userId": 1, "day": day, "n": n, "total": total})),
                Params::new(),
            )
            .await?;
    }

    let by_email = users
        .get(to_properties(json!({"email": "ann@example.com"})), Params::new().index("gs2"))
        .await?
        .into_item();
    println!("by email {by_email:?}");

    let day = orders
        .find(to_properties(json!({"userId": 1, "day": "2024-01-01"})), Params::new())
        .await?
        .into_page();
    println!("orders on 2024-01-01: {}", day.len());

    let recent = orders
        .find(to_properties(json!({})), Params::new().index("gs1").limit(2))
        .await?
        .into_page();
    println!("first page of all orders: {:?} next={:?}", recent.items, recent.next);

    let groups = users
        .fetch(&["User", "Order"], to_properties(json!({"id": 1})), Params::new())
        .await?;
    for (model, items) in &groups {
        println!("{model}: {}", items.len());
    }

    log::info!("{} items stored", store.len());
    Ok(())
}
