//! Ask command
//!
//! Relays free text to the assistant responder.

use anyhow::{anyhow, Result};
use sitequota_core::services::messaging::{AssistantAction, AssistantReply};
use sitequota_core::services::{MessageRouter, Request};

use super::Context;
use crate::output::{print_info, print_json, OutputFormat};

pub async fn execute(ctx: &Context, text: String) -> Result<()> {
    let router = MessageRouter::new(ctx.engine.clone());
    let response = router.handle(Request::ProcessUserInput { text }).await;

    if ctx.format == OutputFormat::Json {
        return print_json(&response);
    }

    if !response.success {
        return Err(anyhow!(response
            .error
            .unwrap_or_else(|| "No reply".to_string())));
    }

    let reply: AssistantReply = serde_json::from_value(response.data.unwrap_or_default())?;
    println!("{}", reply.reply);
    for action in &reply.actions {
        match action {
            AssistantAction::Highlight { text } => {
                print_info(&format!("  -> highlight: {}", text), ctx.quiet)
            }
        }
    }
    Ok(())
}
