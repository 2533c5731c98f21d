//! Demonstration tool-set.
//!
//! A small registry exercising the streaming core: a multi-step
//! processing tool, a notification stream driver, and a metrics
//! snapshot. Registered by the server binary at startup; the engine
//! itself is tool-agnostic.

use crate::dispatch::{ResourceRegistry, ToolRegistry};
use serde_json::json;
use std::time::Duration;

/// Build the demo tool and resource registries.
pub fn demo_registry() -> anyhow::Result<(ToolRegistry, ResourceRegistry)> {
    let mut tools = ToolRegistry::new();

    tools.register(
        "process_data",
        "Process data in steps with progress and log notifications",
        json!({
            "type": "object",
            "properties": {
                "data": {
                    "type": "string",
                    "description": "Input data to process"
                },
                "steps": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Number of processing steps (default 3)"
                }
            },
            "required": ["data"]
        }),
        |ctx, args| {
            Box::pin(async move {
                let data = args["data"].as_str().unwrap_or_default().to_string();
                let steps = args["steps"].as_u64().unwrap_or(3);

                ctx.state.metrics().record_request();
                ctx.log(
                    "info",
                    format!("Processing request {}", ctx.state.metrics().requests()),
                )
                .await?;

                let mut completed = 0;
                for step in 0..steps {
                    if ctx.is_cancelled() {
                        ctx.log("info", format!("Cancelled after step {}", completed))
                            .await?;
                        return Ok(json!(format!(
                            "Cancelled processing {} after {} of {} steps",
                            data, completed, steps
                        )));
                    }
                    ctx.progress(
                        (step + 1) as f64 / steps as f64,
                        Some(1.0),
                        Some(&format!("Processing step {}/{}", step + 1, steps)),
                    )
                    .await?;
                    ctx.log("debug", format!("Completed step {}", step + 1))
                        .await?;
                    completed += 1;
                }

                ctx.resource_updated(&format!("state://processed/{}", data))
                    .await?;
                Ok(json!(format!("Processed {} in {} steps", data, completed)))
            })
        },
    )?;

    tools.register(
        "stream_notifications",
        "Emit a stream of progress notifications",
        json!({
            "type": "object",
            "properties": {
                "count": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Number of notifications to send"
                },
                "interval": {
                    "type": "number",
                    "minimum": 0,
                    "description": "Seconds between notifications (default 1.0)"
                }
            },
            "required": ["count"]
        }),
        |ctx, args| {
            Box::pin(async move {
                let count = args["count"].as_u64().unwrap_or(0);
                let interval = args["interval"].as_f64().unwrap_or(1.0);

                let mut sent = 0;
                for i in 0..count {
                    ctx.progress(
                        (i + 1) as f64 / count as f64,
                        None,
                        Some(&format!("Sent {}/{} notifications", i + 1, count)),
                    )
                    .await?;
                    sent += 1;

                    if i + 1 < count && interval > 0.0 {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {}
                            _ = ctx.cancel.cancelled() => {
                                return Ok(json!(format!("Cancelled after {} notifications", sent)));
                            }
                        }
                    }
                    if ctx.is_cancelled() {
                        return Ok(json!(format!("Cancelled after {} notifications", sent)));
                    }
                }

                Ok(json!(format!("Sent {} notifications", sent)))
            })
        },
    )?;

    tools.register(
        "get_metrics",
        "Get server metrics",
        json!({
            "type": "object",
            "properties": {},
            "required": []
        }),
        |ctx, _args| {
            Box::pin(async move {
                Ok(json!({
                    "total_requests": ctx.state.metrics().requests(),
                    "total_errors": ctx.state.metrics().errors(),
                    "active_sessions": ctx.state.sessions().session_count().await,
                }))
            })
        },
    )?;

    let mut resources = ResourceRegistry::new();
    resources.register(
        "state://metrics",
        "Server metrics",
        "Request counters and session count",
        |state| {
            Box::pin(async move {
                Ok(format!(
                    "Server Metrics:\n- Total Requests: {}\n- Total Errors: {}\n- Active Sessions: {}\n",
                    state.metrics().requests(),
                    state.metrics().errors(),
                    state.sessions().session_count().await,
                ))
            })
        },
    )?;

    Ok((tools, resources))
}
