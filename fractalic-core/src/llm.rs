//! The `@llm` operation and the mediator that drives the chat
//!
//! Context construction follows three normative cases: block only, prompt
//! only (everything preceding the operation), or block then prompt. The
//! mediator loops over tool calls up to the configured turn cap, retries
//! transient transport failures with exponential backoff, and streams
//! tokens to the progress sink when no tools are in play.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::address;
use crate::error::{FractalicError, Result};
use crate::events::Stage;
use crate::handlers::{clone_nodes, wrap_output};
use crate::interpreter::{HandlerOutput, Interpreter, MergeRequest, RunContext};
use crate::node::{NodeKey, Role};
use crate::ops::{effective_header, LlmParams};
use crate::provider::{ChatError, ChatMessage, ChatRequest, ChatResponse, ChatRole};
use crate::render::render_nodes;

/// Default header wrapped around `@llm` output
pub const LLM_HEADER: &str = "# LLM response block";

/// Execute an `@llm` operation
pub async fn execute(
    interp: &Interpreter,
    ctx: &mut RunContext,
    op: &NodeKey,
    params: LlmParams,
) -> Result<HandlerOutput> {
    interp.check_cancelled()?;

    let provider_name = params
        .provider
        .clone()
        .unwrap_or_else(|| interp.config.default_provider.clone());
    let provider_cfg = interp.config.provider(&provider_name).cloned().unwrap_or_default();
    let model = params
        .model
        .clone()
        .or_else(|| (!provider_cfg.model.is_empty()).then(|| provider_cfg.model.clone()))
        .ok_or_else(|| {
            FractalicError::llm(format!(
                "no model configured for provider `{}`",
                provider_name
            ))
        })?;

    let mut messages = build_turns(ctx, op, &params)?;
    if !params.media.is_empty() {
        attach_media(&mut messages, &params);
    }

    // O-series style restrictions: pinned models take no sampling overrides
    let temperature = if provider_cfg.sampling_pinned(&model) {
        None
    } else {
        params.temperature.or(provider_cfg.temperature)
    };

    let schemas = interp.registry.schemas(&params.tools).await;
    let max_turns = params
        .tools_turns_max
        .unwrap_or(interp.config.tools_turns_max)
        .max(1);

    let mut final_text = String::new();
    for turn in 0..max_turns {
        let request = ChatRequest {
            model: model.clone(),
            temperature,
            top_p: None,
            stop_sequences: params.stop_sequences.clone(),
            messages: messages.clone(),
            tools: schemas.clone(),
        };

        let stream_tokens = schemas.is_empty();
        let response = chat_with_retries(interp, request, stream_tokens).await?;
        interp
            .recorder
            .publish(
                Stage::LlmTurn,
                0.0,
                format!("turn {} of {} for {}", turn + 1, max_turns, model),
            )
            .await;

        if response.tool_calls.is_empty() {
            final_text = response.content;
            break;
        }

        final_text = response.content.clone();
        let mut assistant = ChatMessage::assistant(response.content);
        assistant.tool_calls = response.tool_calls.clone();
        messages.push(assistant);

        // Execute the calls in the order the model returned them
        for call in &response.tool_calls {
            let reply = match serde_json::from_str::<Value>(&call.arguments) {
                Err(_) => {
                    // a malformed call gets a synthesized reply, not a failed run
                    warn!("tool {} called with malformed arguments", call.name);
                    json!({ "error": "bad arguments" })
                }
                Ok(args) => {
                    interp
                        .recorder
                        .publish(Stage::ToolCall, 0.0, format!("calling {}", call.name))
                        .await;
                    let result = interp.registry.call(&call.name, &args).await?;
                    interp
                        .recorder
                        .record_tool_call(op, &call.name, args, result.clone());
                    result
                }
            };
            messages.push(ChatMessage::tool(call.id.clone(), serde_json::to_string(&reply)?));
        }
    }

    if let Some(path) = &params.save_to_file {
        let target = ctx.dir().join(path);
        tokio::fs::write(&target, &final_text).await?;
        debug!("saved @llm output to {}", target.display());
    }

    let header = effective_header(&params.use_header, Some(LLM_HEADER));
    let fragment = wrap_output(header, &final_text, &mut ctx.keygen);
    Ok(HandlerOutput::merged(MergeRequest {
        fragment,
        mode: params.mode,
        to: params.to,
    }))
}

/// One provider call with the retry and timeout policy applied
async fn chat_with_retries(
    interp: &Interpreter,
    request: ChatRequest,
    stream_tokens: bool,
) -> Result<ChatResponse> {
    let timeout = Duration::from_secs(interp.config.timeouts.llm_secs);
    let max_attempts = interp.config.retry.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = if stream_tokens {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            let recorder = Arc::clone(&interp.recorder);
            let forwarder = tokio::spawn(async move {
                while let Some(token) = rx.recv().await {
                    recorder
                        .publish(Stage::LlmTurn, 0.0, token)
                        .await;
                }
            });
            let on_token = move |token: &str| {
                let _ = tx.send(token.to_string());
            };
            let call = interp.provider.chat_streaming(request.clone(), &on_token);
            let result = tokio::time::timeout(timeout, call).await;
            drop(on_token);
            let _ = forwarder.await;
            result
        } else {
            tokio::time::timeout(timeout, interp.provider.chat(request.clone())).await
        };

        match result {
            Err(_) => return Err(FractalicError::cancelled("@llm call timed out")),
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(ChatError::Transport(msg))) if attempt < max_attempts => {
                let delay = interp.config.retry.base_delay_ms.saturating_mul(1 << (attempt - 1));
                warn!(
                    "llm transport failure (attempt {} of {}): {}; retrying in {}ms",
                    attempt, max_attempts, msg, delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

/// Build the chat turns for an `@llm` operation
pub fn build_turns(
    ctx: &RunContext,
    op: &NodeKey,
    params: &LlmParams,
) -> Result<Vec<ChatMessage>> {
    let mut turns = match (&params.block, &params.prompt) {
        (Some(spec), _) => {
            let selected = address::select_spec(&ctx.tree, spec)?;
            turns_from_nodes(ctx, &selected)
        }
        (None, Some(_)) => {
            let preceding: Vec<NodeKey> = ctx
                .tree
                .iter()
                .take_while(|n| &n.key != op)
                .map(|n| n.key.clone())
                .collect();
            turns_from_nodes(ctx, &preceding)
        }
        (None, None) => {
            return Err(FractalicError::internal(
                "@llm without prompt or block slipped past validation",
            ))
        }
    };
    if let Some(prompt) = &params.prompt {
        turns.push(ChatMessage::user(prompt));
    }
    Ok(turns)
}

/// Fold a node sequence into chat turns, consecutive same-role nodes
/// becoming one message
fn turns_from_nodes(ctx: &RunContext, keys: &[NodeKey]) -> Vec<ChatMessage> {
    let mut turns: Vec<ChatMessage> = Vec::new();
    let mut current_role: Option<Role> = None;
    let mut group: Vec<NodeKey> = Vec::new();

    let mut flush = |role: Option<Role>, group: &mut Vec<NodeKey>, turns: &mut Vec<ChatMessage>| {
        if group.is_empty() {
            return;
        }
        let nodes = clone_nodes(&ctx.tree, group);
        let content = render_nodes(nodes.iter());
        group.clear();
        if content.trim().is_empty() {
            return;
        }
        turns.push(match role {
            Some(Role::Assistant) => ChatMessage::assistant(content),
            _ => ChatMessage::user(content),
        });
    };

    for key in keys {
        let Some(node) = ctx.tree.get(key) else { continue };
        if current_role != Some(node.role) {
            flush(current_role, &mut group, &mut turns);
            current_role = Some(node.role);
        }
        group.push(key.clone());
    }
    flush(current_role, &mut group, &mut turns);
    turns
}

/// Media goes on the first user message; one is synthesized if the
/// context has none
fn attach_media(messages: &mut Vec<ChatMessage>, params: &LlmParams) {
    let attachments: Vec<_> = params.media.iter().map(std::path::PathBuf::from).collect();
    if let Some(first_user) = messages.iter_mut().find(|m| m.role == ChatRole::User) {
        first_user.attachments = attachments;
        return;
    }
    let mut message = ChatMessage::user("");
    message.attachments = attachments;
    messages.push(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::KeyGen;
    use crate::ops::{BlockSpec, OpParams};
    use crate::parser::parse_document;
    use std::path::Path;

    fn context(source: &str) -> RunContext {
        let mut keygen = KeyGen::new();
        let tree = parse_document(source, &mut keygen).unwrap();
        RunContext::new(tree, keygen, Path::new("doc.md"), 0)
    }

    fn llm_params(yaml: &str) -> LlmParams {
        let mapping = serde_yaml::from_str(yaml).unwrap();
        match OpParams::parse(crate::node::OpName::Llm, &mapping, 1).unwrap() {
            OpParams::Llm(p) => p,
            _ => unreachable!(),
        }
    }

    fn op_key(ctx: &RunContext) -> NodeKey {
        ctx.tree
            .iter()
            .find(|n| n.is_operation())
            .map(|n| n.key.clone())
            .unwrap_or_else(|| ctx.tree.tail().unwrap().key.clone())
    }

    #[test]
    fn test_prompt_only_context_is_everything_preceding() {
        let ctx = context("# a\nalpha\n@llm\nprompt: question\n\n# z\nomega\n");
        let op = op_key(&ctx);
        let turns = build_turns(&ctx, &op, &llm_params("prompt: question")).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, ChatRole::User);
        assert!(turns[0].content.contains("alpha"));
        assert!(!turns[0].content.contains("omega"));
        assert_eq!(turns[1].content, "question");
    }

    #[test]
    fn test_block_only_context_uses_resolved_nodes() {
        let ctx = context("# a {id=a}\nalpha\n# b {id=b}\nbeta\n@llm\nblock: b\n");
        let op = op_key(&ctx);
        let turns = build_turns(&ctx, &op, &llm_params("block: b")).unwrap();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].content.contains("beta"));
        assert!(!turns[0].content.contains("alpha"));
    }

    #[test]
    fn test_block_and_prompt_appends_final_user_turn() {
        let ctx = context("# a {id=a}\nalpha\n@llm\nblock: a\nprompt: summarize\n");
        let op = op_key(&ctx);
        let params = llm_params("block: a\nprompt: summarize");
        let turns = build_turns(&ctx, &op, &params).unwrap();
        assert_eq!(turns.len(), 2);
        assert!(turns[0].content.contains("alpha"));
        assert_eq!(turns[1].content, "summarize");
        assert_eq!(turns[1].role, ChatRole::User);
    }

    #[test]
    fn test_roles_fold_into_alternating_turns() {
        let mut ctx = context("# a {id=a}\nalpha\nbeta\n# b {id=b}\ngamma\n");
        // mark the second block's heading as generated output
        let keys = ctx.tree.keys_in_order();
        ctx.tree.get_mut(&keys[2]).unwrap().role = Role::Assistant;

        let spec = BlockSpec::Many(vec!["a/*".to_string(), "b/*".to_string()]);
        let selected = address::select_spec(&ctx.tree, &spec).unwrap();
        let turns = turns_from_nodes(&ctx, &selected);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, ChatRole::User);
        assert_eq!(turns[1].role, ChatRole::Assistant);
        assert_eq!(turns[2].role, ChatRole::User);
    }

    #[test]
    fn test_media_attaches_to_first_user_turn() {
        let mut messages = vec![ChatMessage::assistant("prior"), ChatMessage::user("ask")];
        let params = llm_params("prompt: x\nmedia: [diagram.png]");
        attach_media(&mut messages, &params);
        assert!(messages[0].attachments.is_empty());
        assert_eq!(messages[1].attachments.len(), 1);
    }
}
