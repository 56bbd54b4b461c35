use anyhow::{Context, Result};
use hyper::Method;
use serde_json::Value;

use crate::transport::{RequestOptions, ResponseBody, Transport};

/// `ping`: one GET / through the transport, printing status and body
pub async fn cmd_ping(transport: &Transport) -> Result<()> {
    let response = transport
        .perform_request(Method::GET, "/", RequestOptions::new())
        .await
        .context("ping failed")?;

    println!("status: {}", response.status);
    print_body(&response.body)?;
    Ok(())
}

/// `nodes`: force a discovery round and print the resulting pool
pub async fn cmd_nodes(transport: &Transport) -> Result<()> {
    transport.sniff_hosts().await.context("discovery failed")?;

    let connections = transport.connections();
    println!(
        "{} node(s), {} live",
        connections.len(),
        transport.alive_connections()
    );
    for connection in connections {
        println!("  {}", connection.host());
    }
    Ok(())
}

/// `request`: arbitrary method/path with optional body and query parameters
pub async fn cmd_request(
    transport: &Transport,
    method: &str,
    path: &str,
    body: Option<&str>,
    params: &[String],
) -> Result<()> {
    let method: Method = method
        .to_uppercase()
        .parse()
        .with_context(|| format!("invalid HTTP method: {method}"))?;

    let mut options = RequestOptions::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("parameter must be key=value, got {param:?}"))?;
        options = options.param(key, value);
    }
    if let Some(body) = body {
        // Structured bodies get proper JSON serialization; anything else is
        // sent verbatim
        match serde_json::from_str::<Value>(body) {
            Ok(value) => options = options.body(value),
            Err(_) => options = options.body(body.to_string()),
        }
    }

    let response = transport
        .perform_request(method, path, options)
        .await
        .context("request failed")?;

    println!("status: {}", response.status);
    print_body(&response.body)?;
    Ok(())
}

fn print_body(body: &ResponseBody) -> Result<()> {
    match body {
        ResponseBody::Empty => {}
        ResponseBody::Json(value) => println!("{}", serde_json::to_string_pretty(value)?),
        ResponseBody::Text(text) => println!("{text}"),
    }
    Ok(())
}
