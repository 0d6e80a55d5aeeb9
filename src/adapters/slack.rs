//! Slack gateway over the Web API.
//!
//! Delivery failures are classified for the dispatch loop: rate limits
//! and network trouble are transient, a closed set of API error codes
//! (bad channel, dead credentials) is permanent. Slack has no
//! idempotency token, so a lease replay can duplicate a message; the
//! dedup key in the payload bounds that to crash windows.

use std::sync::Arc;

use async_trait::async_trait;
use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest, SlackApiConversationsArchiveRequest,
    SlackApiConversationsCreateRequest, SlackApiConversationsSetTopicRequest, SlackApiToken,
    SlackApiTokenType, SlackApiTokenValue, SlackChannelId, SlackClient,
    SlackClientHyperHttpsConnector, SlackClientSession, SlackMessageContent,
};
use tracing::debug;

use crate::models::{NotificationPayload, OutboxEntry};
use crate::outbox::AdapterGateway;
use crate::{RelayError, Result};

/// API error codes that will never succeed on retry.
const PERMANENT_API_ERRORS: &[&str] = &[
    "channel_not_found",
    "is_archived",
    "not_in_channel",
    "invalid_auth",
    "account_inactive",
    "token_revoked",
    "msg_too_long",
    "no_text",
    "restricted_action",
];

/// Slack-backed implementation of [`AdapterGateway`].
pub struct SlackGateway {
    client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    bot_token: SlackApiToken,
}

impl SlackGateway {
    /// Build a gateway from a bot token.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Adapter` if the HTTPS connector cannot be
    /// created.
    pub fn new(bot_token: String) -> Result<Self> {
        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| RelayError::Adapter(format!("failed to init slack connector: {err}")))?;
        let client = Arc::new(SlackClient::new(connector));
        let bot_token = SlackApiToken {
            token_value: SlackApiTokenValue(bot_token),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::Bot),
        };
        Ok(Self { client, bot_token })
    }

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.bot_token)
    }

    async fn post_text(&self, channel: &str, text: String) -> Result<()> {
        let content = SlackMessageContent {
            text: Some(text),
            blocks: None,
            attachments: None,
            upload: None,
            files: None,
            reactions: None,
            metadata: None,
        };
        let request = SlackApiChatPostMessageRequest {
            channel: SlackChannelId(channel.to_owned()),
            content,
            as_user: None,
            icon_emoji: None,
            icon_url: None,
            link_names: Some(true),
            parse: None,
            thread_ts: None,
            username: None,
            reply_broadcast: None,
            unfurl_links: None,
            unfurl_media: None,
        };

        self.session()
            .chat_post_message(&request)
            .await
            .map(|_| ())
            .map_err(|err| classify_delivery(channel, &err))
    }
}

#[async_trait]
impl AdapterGateway for SlackGateway {
    async fn deliver(&self, entry: &OutboxEntry) -> Result<()> {
        let text = render_payload(&entry.payload);
        self.post_text(&entry.recipient, text).await?;
        debug!(
            entry_id = %entry.id,
            message_id = %entry.payload.message_id,
            channel = %entry.recipient,
            "slack message posted"
        );
        Ok(())
    }

    async fn create_channel(&self, name: &str) -> Result<String> {
        let request = SlackApiConversationsCreateRequest::new(name.to_owned());
        let response = self
            .session()
            .conversations_create(&request)
            .await
            .map_err(|err| RelayError::Adapter(format!("conversations.create: {err}")))?;
        Ok(response.channel.id.0)
    }

    async fn send_message(&self, channel: &str, text: &str) -> Result<()> {
        self.post_text(channel, text.to_owned())
            .await
            .map_err(|err| RelayError::Adapter(err.to_string()))
    }

    async fn update_title(&self, channel: &str, title: &str) -> Result<()> {
        let request = SlackApiConversationsSetTopicRequest::new(
            SlackChannelId(channel.to_owned()),
            title.to_owned(),
        );
        self.session()
            .conversations_set_topic(&request)
            .await
            .map(|_| ())
            .map_err(|err| RelayError::Adapter(format!("conversations.setTopic: {err}")))
    }

    async fn delete_channel(&self, channel: &str) -> Result<()> {
        // Slack has no hard delete; archiving is the terminal state.
        let request =
            SlackApiConversationsArchiveRequest::new(SlackChannelId(channel.to_owned()));
        self.session()
            .conversations_archive(&request)
            .await
            .map(|_| ())
            .map_err(|err| RelayError::Adapter(format!("conversations.archive: {err}")))
    }
}

fn render_payload(payload: &NotificationPayload) -> String {
    match &payload.attachment {
        Some(attachment) => format!("{}\n(attachment: {attachment})", payload.body),
        None => payload.body.clone(),
    }
}

fn classify_delivery(
    channel: &str,
    error: &slack_morphism::errors::SlackClientError,
) -> RelayError {
    use slack_morphism::errors::SlackClientError;

    match error {
        SlackClientError::RateLimitError(rate) => RelayError::TransientDelivery(format!(
            "rate limited on {channel}, retry after {:?}",
            rate.retry_after
        )),
        SlackClientError::ApiError(api) => {
            let code = api.code.as_str();
            if PERMANENT_API_ERRORS.contains(&code) {
                RelayError::PermanentDelivery(format!("slack api error on {channel}: {code}"))
            } else {
                RelayError::TransientDelivery(format!("slack api error on {channel}: {code}"))
            }
        }
        other => RelayError::TransientDelivery(format!("slack call failed on {channel}: {other}")),
    }
}
