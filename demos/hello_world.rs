//! Minimal restline service behind the Tokio TCP front end.
//!
//! ```text
//! cargo run --example hello_world
//! curl http://127.0.0.1:8080/hello/ada
//! curl http://127.0.0.1:8080/items/42
//! ```

use std::sync::Arc;

use restline::server::Server;
use restline::{
    Controller, GroupConfig, HandlerResult, HttpContext, HttpService, ManipulatorError, Method,
    Route, RoutingEntry, ServiceConfig,
};
use tracing_subscriber::EnvFilter;

struct Items;

impl Controller for Items {}

impl Items {
    fn show(&self, ctx: &mut HttpContext) -> HandlerResult {
        let id = ctx.params().get("id").unwrap_or_default().to_owned();
        ctx.response_mut()
            .set_body(serde_json::json!({ "id": id }).to_string());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env()?.with_group(GroupConfig::multi("io", 4));
    let mut service = HttpService::new(config)?;

    service.register(Route::from_fn(Method::Get, "/hello/{name}", "default", |ctx| {
        let name = ctx.params().get("name").unwrap_or("world").to_owned();
        ctx.response_mut().set_body(format!("Hello, {name}!"));
        Ok(())
    }))?;
    service.register(
        Route::new(Method::Get, "/items/{id}", "io", Arc::new(Items), Items::show)
            .content_type("application/json"),
    )?;

    if let Some(group) = service.group_mut("io") {
        group.add_post(
            |ctx: &mut HttpContext, entry: &RoutingEntry| -> Result<(), ManipulatorError> {
                ctx.response_mut().set_header("X-Route", entry.identifier());
                Ok(())
            },
        );
    }

    let server = Server::bind("127.0.0.1:8080").await?;
    println!("Listening on http://{}", server.local_addr());
    server
        .run(service, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
