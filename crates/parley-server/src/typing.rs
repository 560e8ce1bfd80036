//! Typing indicators: ephemeral broadcast with a per-(user, dialogue)
//! auto-clear timer. Nothing here touches the store beyond the
//! membership check.

use crate::error::CoreError;
use crate::fabric::dialogue_group;
use crate::timers::TimerKey;
use crate::App;
use parley_proto::ServerEvent;
use std::sync::Arc;

pub async fn handle_typing(
    app: &Arc<App>,
    user_id: &str,
    dialogue_id: &str,
    is_typing: bool,
) -> Result<(), CoreError> {
    let d = dialogue_id.to_string();
    let u = user_id.to_string();
    let member = app.store.run(move |s| s.is_participant(&d, &u)).await?;
    if !member {
        return Err(CoreError::Store(parley_store::StoreError::NotParticipant));
    }

    let event = ServerEvent::TypingStatusBroadcast {
        dialogue_id: dialogue_id.to_string(),
        user_id: user_id.to_string(),
        is_typing,
    };
    app.fabric.publish(&dialogue_group(dialogue_id), &event).await;

    let key = TimerKey::Typing {
        user_id: user_id.to_string(),
        dialogue_id: dialogue_id.to_string(),
    };
    if is_typing {
        // A fresh event resets the clock; arming cancels the old timer.
        let app = app.clone();
        let user = user_id.to_string();
        let dialogue = dialogue_id.to_string();
        app.timers.clone().arm(key, app.config.typing_timeout, move || async move {
            let clear = ServerEvent::TypingStatusBroadcast {
                dialogue_id: dialogue.clone(),
                user_id: user,
                is_typing: false,
            };
            app.fabric.publish(&dialogue_group(&dialogue), &clear).await;
        });
    } else {
        app.timers.cancel(&key);
    }
    Ok(())
}

/// Session teardown: drop the user's pending auto-clear timers and
/// broadcast the clear they will no longer deliver, so peers never hold
/// a stale indicator past the disconnect.
pub async fn clear_on_disconnect(app: &Arc<App>, user_id: &str) {
    for dialogue_id in app.timers.cancel_typing_for(user_id) {
        let clear = ServerEvent::TypingStatusBroadcast {
            dialogue_id: dialogue_id.clone(),
            user_id: user_id.to_string(),
            is_typing: false,
        };
        app.fabric.publish(&dialogue_group(&dialogue_id), &clear).await;
    }
}
