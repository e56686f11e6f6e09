//! Runs a small order workflow against an on-disk SQLite store.
//!
//! The order spawns one shipment child per item and finishes once the first
//! shipment wakes it up. Set `DURASTATE_DATABASE_URL` to reuse a store across
//! runs, and `DURASTATE_LOG_FORMAT`/`DURASTATE_LOG_LEVEL` to tune logging.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use durastate::providers::Provider;
use durastate::providers::sqlite::SqliteProvider;
use durastate::runtime::{
    LoggingConfig, NextAction, Runtime, RuntimeOptions, StateError, StateType, WorkflowDefinition, WorkflowRegistry,
    init_logging,
};
use durastate::{Client, InstanceStatus, NewWorkflowInstance};

fn order_workflow() -> Result<WorkflowDefinition, String> {
    WorkflowDefinition::builder("order")
        .description("Splits an order into shipments and waits for the first delivery")
        .register_state("begin", StateType::Start)
        .register_state("waitShipments", StateType::Normal)
        .register_state("done", StateType::End)
        .register_state("error", StateType::Manual)
        .initial_state("begin")
        .error_state("error")
        .permit("begin", "waitShipments")
        .permit("waitShipments", "done")
        .on_state("begin", |ctx| async move {
            let items: Vec<String> = ctx.get_variable_as("items")?.unwrap_or_default();
            if items.is_empty() {
                return Err(StateError::permanent("order has no items"));
            }
            for item in &items {
                ctx.add_child_workflow(
                    NewWorkflowInstance::new("shipment")
                        .with_external_id(format!("{}-{item}", ctx.external_id()))
                        .with_variable("item", item.clone()),
                );
            }
            Ok(NextAction::move_to_state_after(
                "waitShipments",
                durastate::now_millis() + 60_000,
                format!("Created {} shipments", items.len()),
            ))
        })
        .on_state("waitShipments", |ctx| async move {
            // Woken by the first delivered shipment, or by the fallback timer
            let expected = ctx.get_variable_as::<Vec<String>>("items")?.unwrap_or_default().len();
            Ok(NextAction::move_to_state(
                "done",
                format!("Shipping started for {expected} items"),
            ))
        })
        .build()
}

fn shipment_workflow() -> Result<WorkflowDefinition, String> {
    WorkflowDefinition::builder("shipment")
        .register_state("pack", StateType::Start)
        .register_state("delivered", StateType::End)
        .register_state("error", StateType::Manual)
        .initial_state("pack")
        .error_state("error")
        .permit("pack", "delivered")
        .on_state("pack", |ctx| async move {
            let item = ctx.get_variable_or("item", "unknown");
            ctx.wakeup_parent_workflow(["waitShipments"]);
            Ok(NextAction::move_to_state("delivered", format!("Packed and shipped {item}")))
        })
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logging = LoggingConfig::from_env().map_err(anyhow::Error::msg)?;
    init_logging(&logging).map_err(anyhow::Error::msg)?;

    let workflows = WorkflowRegistry::builder()
        .register_result(order_workflow())
        .register_result(shipment_workflow())
        .build_result()
        .map_err(anyhow::Error::msg)?;

    let url = std::env::var("DURASTATE_DATABASE_URL").unwrap_or_else(|_| "sqlite:durastate-demo.db?mode=rwc".to_string());
    let store: Arc<dyn Provider> = Arc::new(
        SqliteProvider::new(&url, None)
            .await
            .with_context(|| format!("opening {url}"))?,
    );

    let options = RuntimeOptions::from_env().map_err(anyhow::Error::msg)?;
    let runtime = Runtime::start(store.clone(), workflows.clone(), options).await?;
    let client = Client::new(store).with_workflows(workflows);

    let order_id = client
        .create_workflow(
            NewWorkflowInstance::new("order")
                .with_external_id(format!("demo-{}", durastate::now_millis()))
                .with_variable("items", r#"["book","lamp","mug"]"#),
        )
        .await?;

    let order = client
        .wait_for_status(
            order_id,
            &[InstanceStatus::Finished, InstanceStatus::Manual],
            Duration::from_secs(30),
        )
        .await?;
    println!("order {order_id} ended in {} ({})", order.state, order.status);
    for action in client.list_actions(order_id).await? {
        println!(
            "  {:<14} {:<22} {}",
            action.state,
            action.action_type.as_str(),
            action.state_text.unwrap_or_default()
        );
    }
    for child in client.list_children(order_id).await? {
        println!("  child {} {} -> {}", child.id, child.external_id, child.state);
    }

    runtime.shutdown().await;
    Ok(())
}
