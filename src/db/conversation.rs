//! Conversation repository for message and context persistence

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::DbPool;
use crate::{Error, Result};

/// A diagnostic conversation
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    /// Primary language ("en" or "ka"), set once the first turn resolves it
    pub language: Option<String>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Active,
    Closed,
}

impl ConversationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// A message in a conversation, immutable once created
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Language of `content` ("en" or "ka")
    pub language: Option<String>,
    /// Pre-translation text, kept when the delivered reply was translated
    pub original_content: Option<String>,
    /// Moderation audit flag
    pub flagged: bool,
    /// Relevance verdict: `None` when classification was bypassed
    pub relevant: Option<bool>,
    pub created_at: DateTime<Utc>,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Fields of a message about to be persisted
#[derive(Debug, Clone, Copy)]
pub struct NewMessage<'a> {
    pub role: MessageRole,
    pub content: &'a str,
    pub language: Option<&'a str>,
    pub original_content: Option<&'a str>,
    pub flagged: bool,
    pub relevant: Option<bool>,
}

impl<'a> NewMessage<'a> {
    /// An accepted message with no audit marks.
    #[must_use]
    pub const fn accepted(role: MessageRole, content: &'a str) -> Self {
        Self {
            role,
            content,
            language: None,
            original_content: None,
            flagged: false,
            relevant: None,
        }
    }
}

/// A compressed history summary
#[derive(Debug, Clone)]
pub struct CompressedContext {
    pub id: String,
    pub conversation_id: String,
    /// Monotonically increasing per conversation
    pub version: i64,
    /// JSON payload produced by the compressor
    pub content: String,
    /// Turn count at the time of compression
    pub watermark: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(
        &self,
        user_id: &str,
        title: &str,
        language: Option<&str>,
    ) -> Result<Conversation> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        conn.execute(
            "INSERT INTO conversations (id, user_id, title, language, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
            rusqlite::params![&id, user_id, title, language, &now_str],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            language: language.map(String::from),
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    /// Look up a conversation by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversation = conn
            .query_row(
                "SELECT id, user_id, title, language, status, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        title: row.get(2)?,
                        language: row.get(3)?,
                        status: ConversationStatus::from_str(&row.get::<_, String>(4)?)
                            .unwrap_or(ConversationStatus::Active),
                        created_at: parse_datetime(&row.get::<_, String>(5)?),
                        updated_at: parse_datetime(&row.get::<_, String>(6)?),
                    })
                },
            )
            .ok();

        Ok(conversation)
    }

    /// List a user's conversations, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, title, language, status, created_at, updated_at
                 FROM conversations WHERE user_id = ?1 ORDER BY updated_at DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversations = stmt
            .query_map([user_id], |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    title: row.get(2)?,
                    language: row.get(3)?,
                    status: ConversationStatus::from_str(&row.get::<_, String>(4)?)
                        .unwrap_or(ConversationStatus::Active),
                    created_at: parse_datetime(&row.get::<_, String>(5)?),
                    updated_at: parse_datetime(&row.get::<_, String>(6)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(conversations)
    }

    /// Record the conversation's primary language
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_language(&self, conversation_id: &str, language: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE conversations SET language = ?1 WHERE id = ?2",
            [language, conversation_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Change the conversation's lifecycle status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_status(&self, conversation_id: &str, status: ConversationStatus) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3",
            [status.as_str(), &Utc::now().to_rfc3339(), conversation_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Append a message and bump the conversation's `updated_at`, as one
    /// transaction so no half-written turn is ever visible
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<Message> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, language, original_content, flagged, relevant, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                &id,
                conversation_id,
                message.role.as_str(),
                message.content,
                message.language,
                message.original_content,
                i32::from(message.flagged),
                message.relevant.map(i32::from),
                &now_str
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            [&now_str, conversation_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content.to_string(),
            language: message.language.map(String::from),
            original_content: message.original_content.map(String::from),
            flagged: message.flagged,
            relevant: message.relevant,
            created_at: now,
        })
    }

    /// Recent accepted messages in chronological order.
    ///
    /// Flagged and off-topic messages are audit records and never feed the
    /// pipeline, so they are excluded here.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, language, original_content, flagged, relevant, created_at
                 FROM messages
                 WHERE conversation_id = ?1 AND flagged = 0 AND (relevant IS NULL OR relevant != 0)
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let messages = stmt
            .query_map(rusqlite::params![conversation_id, limit as i64], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: MessageRole::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or(MessageRole::User),
                    content: row.get(3)?,
                    language: row.get(4)?,
                    original_content: row.get(5)?,
                    flagged: row.get::<_, i64>(6)? != 0,
                    relevant: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
                    created_at: parse_datetime(&row.get::<_, String>(8)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        Ok(messages)
    }

    /// Relevance flags of the most recent user messages, newest first.
    ///
    /// Unlike [`Self::get_recent_messages`] this keeps off-topic audit rows,
    /// so an explicit off-topic verdict can close the continuation-bypass
    /// window. Flagged rows never reached classification and are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent_user_relevance(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Option<bool>>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT relevant FROM messages
                 WHERE conversation_id = ?1 AND role = 'user' AND flagged = 0
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let flags = stmt
            .query_map(rusqlite::params![conversation_id, limit as i64], |row| {
                Ok(row.get::<_, Option<i64>>(0)?.map(|v| v != 0))
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(flags)
    }

    /// Accepted messages created after a cutoff, chronological.
    ///
    /// `None` returns the full accepted history; used to slice the
    /// uncompressed window for the history compressor.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_messages_since(
        &self,
        conversation_id: &str,
        after: Option<&DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let cutoff = after.map_or_else(String::new, DateTime::to_rfc3339);

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, language, original_content, flagged, relevant, created_at
                 FROM messages
                 WHERE conversation_id = ?1 AND created_at > ?2
                   AND flagged = 0 AND (relevant IS NULL OR relevant != 0)
                 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let messages = stmt
            .query_map([conversation_id, &cutoff], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: MessageRole::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or(MessageRole::User),
                    content: row.get(3)?,
                    language: row.get(4)?,
                    original_content: row.get(5)?,
                    flagged: row.get::<_, i64>(6)? != 0,
                    relevant: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
                    created_at: parse_datetime(&row.get::<_, String>(8)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(messages)
    }

    /// Count all messages, audit records included
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn message_count(&self, conversation_id: &str) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Count completed turns. A turn completes when its assistant reply is
    /// persisted, so the assistant-message count is the turn count.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn turn_count(&self, conversation_id: &str) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND role = 'assistant'",
                [conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// The active compressed context, if one exists
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_active_context(&self, conversation_id: &str) -> Result<Option<CompressedContext>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let context = conn
            .query_row(
                "SELECT id, conversation_id, version, content, watermark, active, created_at
                 FROM conversation_contexts WHERE conversation_id = ?1 AND active = 1",
                [conversation_id],
                |row| {
                    Ok(CompressedContext {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        version: row.get(2)?,
                        content: row.get(3)?,
                        watermark: row.get(4)?,
                        active: row.get::<_, i64>(5)? != 0,
                        created_at: parse_datetime(&row.get::<_, String>(6)?),
                    })
                },
            )
            .ok();

        Ok(context)
    }

    /// Install a new active compressed context, deactivating the previous one
    /// in the same transaction. Superseded rows are kept as an audit trail.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn replace_context(
        &self,
        conversation_id: &str,
        content: &str,
        watermark: usize,
    ) -> Result<CompressedContext> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM conversation_contexts
                 WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute(
            "UPDATE conversation_contexts SET active = 0 WHERE conversation_id = ?1 AND active = 1",
            [conversation_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        #[allow(clippy::cast_possible_wrap)]
        tx.execute(
            "INSERT INTO conversation_contexts (id, conversation_id, version, content, watermark, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            rusqlite::params![
                &id,
                conversation_id,
                version,
                content,
                watermark as i64,
                &now.to_rfc3339()
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        Ok(CompressedContext {
            id,
            conversation_id: conversation_id.to_string(),
            version,
            content: content.to_string(),
            watermark: watermark as i64,
            active: true,
            created_at: now,
        })
    }

    /// Every compressed context ever written, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn context_history(&self, conversation_id: &str) -> Result<Vec<CompressedContext>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, version, content, watermark, active, created_at
                 FROM conversation_contexts WHERE conversation_id = ?1 ORDER BY version ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let contexts = stmt
            .query_map([conversation_id], |row| {
                Ok(CompressedContext {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    version: row.get(2)?,
                    content: row.get(3)?,
                    watermark: row.get(4)?,
                    active: row.get::<_, i64>(5)? != 0,
                    created_at: parse_datetime(&row.get::<_, String>(6)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(contexts)
    }

    /// Cheap liveness probe
    ///
    /// # Errors
    ///
    /// Returns error if the pool or the database is unavailable
    pub fn ping(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> ConversationRepo {
        let pool = init_memory().unwrap();
        ConversationRepo::new(pool)
    }

    #[test]
    fn test_create_and_find() {
        let repo = setup();

        let conversation = repo
            .create("driver-1", "my brakes squeal", Some("en"))
            .unwrap();
        let found = repo.find(&conversation.id).unwrap().unwrap();

        assert_eq!(found.user_id, "driver-1");
        assert_eq!(found.title, "my brakes squeal");
        assert_eq!(found.language.as_deref(), Some("en"));
        assert_eq!(found.status, ConversationStatus::Active);

        assert!(repo.find("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_for_user() {
        let repo = setup();

        repo.create("driver-1", "first", None).unwrap();
        repo.create("driver-1", "second", None).unwrap();
        repo.create("driver-2", "other", None).unwrap();

        let mine = repo.list_for_user("driver-1").unwrap();
        assert_eq!(mine.len(), 2);
    }

    #[test]
    fn test_append_and_get_messages() {
        let repo = setup();
        let conversation = repo.create("driver-1", "t", None).unwrap();

        repo.append_message(
            &conversation.id,
            NewMessage::accepted(MessageRole::User, "engine knocks"),
        )
        .unwrap();
        repo.append_message(
            &conversation.id,
            NewMessage::accepted(MessageRole::Assistant, "Check the oil level first."),
        )
        .unwrap();

        let messages = repo.get_recent_messages(&conversation.id, 10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "engine knocks");
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }

    #[test]
    fn test_recent_messages_exclude_audit_records() {
        let repo = setup();
        let conversation = repo.create("driver-1", "t", None).unwrap();

        repo.append_message(
            &conversation.id,
            NewMessage {
                flagged: true,
                ..NewMessage::accepted(MessageRole::User, "unsafe")
            },
        )
        .unwrap();
        repo.append_message(
            &conversation.id,
            NewMessage {
                relevant: Some(false),
                ..NewMessage::accepted(MessageRole::User, "what's the weather")
            },
        )
        .unwrap();
        repo.append_message(
            &conversation.id,
            NewMessage {
                relevant: Some(true),
                ..NewMessage::accepted(MessageRole::User, "car stalls")
            },
        )
        .unwrap();

        let messages = repo.get_recent_messages(&conversation.id, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "car stalls");

        // Audit rows are still stored
        assert_eq!(repo.message_count(&conversation.id).unwrap(), 3);
    }

    #[test]
    fn test_recent_user_relevance_keeps_off_topic_rows() {
        let repo = setup();
        let conversation = repo.create("driver-1", "t", None).unwrap();

        repo.append_message(
            &conversation.id,
            NewMessage {
                relevant: Some(true),
                ..NewMessage::accepted(MessageRole::User, "car stalls")
            },
        )
        .unwrap();
        repo.append_message(
            &conversation.id,
            NewMessage::accepted(MessageRole::Assistant, "check the idle valve"),
        )
        .unwrap();
        repo.append_message(
            &conversation.id,
            NewMessage {
                relevant: Some(false),
                ..NewMessage::accepted(MessageRole::User, "what's the weather")
            },
        )
        .unwrap();
        repo.append_message(
            &conversation.id,
            NewMessage {
                flagged: true,
                ..NewMessage::accepted(MessageRole::User, "unsafe")
            },
        )
        .unwrap();

        // Newest first, assistant and flagged rows excluded
        let flags = repo.recent_user_relevance(&conversation.id, 10).unwrap();
        assert_eq!(flags, vec![Some(false), Some(true)]);

        let capped = repo.recent_user_relevance(&conversation.id, 1).unwrap();
        assert_eq!(capped, vec![Some(false)]);
    }

    #[test]
    fn test_turn_count() {
        let repo = setup();
        let conversation = repo.create("driver-1", "t", None).unwrap();

        assert_eq!(repo.turn_count(&conversation.id).unwrap(), 0);

        repo.append_message(
            &conversation.id,
            NewMessage::accepted(MessageRole::User, "q"),
        )
        .unwrap();
        assert_eq!(repo.turn_count(&conversation.id).unwrap(), 0);

        repo.append_message(
            &conversation.id,
            NewMessage::accepted(MessageRole::Assistant, "a"),
        )
        .unwrap();
        assert_eq!(repo.turn_count(&conversation.id).unwrap(), 1);
    }

    #[test]
    fn test_replace_context_keeps_audit_trail() {
        let repo = setup();
        let conversation = repo.create("driver-1", "t", None).unwrap();

        assert!(repo.get_active_context(&conversation.id).unwrap().is_none());

        let first = repo
            .replace_context(&conversation.id, r#"{"summary":"one"}"#, 10)
            .unwrap();
        assert_eq!(first.version, 1);

        let second = repo
            .replace_context(&conversation.id, r#"{"summary":"two"}"#, 20)
            .unwrap();
        assert_eq!(second.version, 2);

        let active = repo.get_active_context(&conversation.id).unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.watermark, 20);

        let history = repo.context_history(&conversation.id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].active);
        assert!(history[1].active);
    }

    #[test]
    fn test_messages_since_cutoff() {
        let repo = setup();
        let conversation = repo.create("driver-1", "t", None).unwrap();

        repo.append_message(
            &conversation.id,
            NewMessage::accepted(MessageRole::User, "before"),
        )
        .unwrap();
        let context = repo
            .replace_context(&conversation.id, "{}", 1)
            .unwrap();
        repo.append_message(
            &conversation.id,
            NewMessage::accepted(MessageRole::User, "after"),
        )
        .unwrap();

        let all = repo.get_messages_since(&conversation.id, None).unwrap();
        assert_eq!(all.len(), 2);

        let window = repo
            .get_messages_since(&conversation.id, Some(&context.created_at))
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "after");
    }

    #[test]
    fn test_set_status_and_language() {
        let repo = setup();
        let conversation = repo.create("driver-1", "t", None).unwrap();

        repo.set_language(&conversation.id, "ka").unwrap();
        repo.set_status(&conversation.id, ConversationStatus::Closed)
            .unwrap();

        let found = repo.find(&conversation.id).unwrap().unwrap();
        assert_eq!(found.language.as_deref(), Some("ka"));
        assert_eq!(found.status, ConversationStatus::Closed);
    }
}
