use chrono::Utc;
use codelens_llm::Role;
use sqlx::Row;

use super::{SqliteStore, format_ts, parse_ts};
use crate::error::StoreError;
use crate::types::{ChatMessage, ChatSession};

impl SqliteStore {
    /// # Errors
    ///
    /// Returns an error if the insert fails, including when the id is taken.
    pub async fn create_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO chat_sessions (id, repository_id, title, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.repository_id)
        .bind(&session.title)
        .bind(format_ts(session.created_at))
        .bind(format_ts(session.updated_at))
        .execute(&mut *tx)
        .await?;
        for message in &session.messages {
            insert_message(&mut tx, &session.id, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if a query fails or a stored value is malformed.
    pub async fn session(&self, id: &str) -> Result<Option<ChatSession>, StoreError> {
        let row: Option<(String, Option<String>, String, String, String)> = sqlx::query_as(
            "SELECT id, repository_id, title, created_at, updated_at \
             FROM chat_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((id, repository_id, title, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT id, role, content, created_at, token_count, chunk_refs, error \
             FROM chat_messages WHERE session_id = ? ORDER BY rowid",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(|row| -> Result<ChatMessage, StoreError> {
                let role: String = row.try_get("role")?;
                let created_at: String = row.try_get("created_at")?;
                let chunk_refs: String = row.try_get("chunk_refs")?;
                Ok(ChatMessage {
                    id: row.try_get("id")?,
                    role: role.parse::<Role>().map_err(|e| StoreError::InvalidData {
                        column: "role",
                        message: e.to_string(),
                    })?,
                    content: row.try_get("content")?,
                    created_at: parse_ts("created_at", &created_at)?,
                    token_count: row.try_get("token_count")?,
                    chunk_refs: serde_json::from_str(&chunk_refs)?,
                    error: row.try_get("error")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ChatSession {
            id,
            repository_id,
            title,
            created_at: parse_ts("created_at", &created_at)?,
            updated_at: parse_ts("updated_at", &updated_at)?,
            messages,
        }))
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the session does not exist.
    pub async fn append_message(
        &self,
        session_id: &str,
        message: &ChatMessage,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        touch_session(&mut tx, session_id).await?;
        insert_message(&mut tx, session_id, message).await?;
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the message is not part of the session.
    pub async fn update_message(
        &self,
        session_id: &str,
        message: &ChatMessage,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE chat_messages SET content = ?, token_count = ?, chunk_refs = ?, error = ? \
             WHERE id = ? AND session_id = ?",
        )
        .bind(&message.content)
        .bind(message.token_count)
        .bind(serde_json::to_string(&message.chunk_refs)?)
        .bind(&message.error)
        .bind(&message.id)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("message", &message.id));
        }
        touch_session(&mut tx, session_id).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn touch_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
        .bind(format_ts(Utc::now()))
        .bind(session_id)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::not_found("session", session_id));
    }
    Ok(())
}

async fn insert_message(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
    message: &ChatMessage,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO chat_messages \
            (id, session_id, role, content, created_at, token_count, chunk_refs, error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(session_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(format_ts(message.created_at))
    .bind(message.token_count)
    .bind(serde_json::to_string(&message.chunk_refs)?)
    .bind(&message.error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkRef;

    async fn store_with_session() -> SqliteStore {
        let s = SqliteStore::new(":memory:").await.unwrap();
        s.create_session(&ChatSession::new("s1", Some("r1".into()), "first"))
            .await
            .unwrap();
        s
    }

    #[tokio::test]
    async fn session_messages_keep_insertion_order() {
        let s = store_with_session().await;
        s.append_message("s1", &ChatMessage::new(Role::User, "question"))
            .await
            .unwrap();
        s.append_message("s1", &ChatMessage::new(Role::Assistant, "answer"))
            .await
            .unwrap();
        let session = s.session("s1").await.unwrap().unwrap();
        assert_eq!(session.repository_id.as_deref(), Some("r1"));
        let roles: Vec<_> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn update_message_replaces_content_in_place() {
        let s = store_with_session().await;
        let mut msg = ChatMessage::new(Role::Assistant, "");
        s.append_message("s1", &msg).await.unwrap();

        msg.content = "partial answer".into();
        msg.token_count = Some(3);
        msg.chunk_refs = vec![ChunkRef {
            chunk_id: "c1".into(),
            file_path: "src/lib.rs".into(),
            start_line: 1,
            end_line: 30,
            score: 0.9,
        }];
        s.update_message("s1", &msg).await.unwrap();

        let session = s.session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "partial answer");
        assert_eq!(session.messages[0].token_count, Some(3));
        assert_eq!(session.messages[0].chunk_refs.len(), 1);
        assert_eq!(session.messages[0].error, None);

        msg.error = Some("completion timed out".into());
        s.update_message("s1", &msg).await.unwrap();
        let session = s.session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages[0].error.as_deref(), Some("completion timed out"));
    }

    #[tokio::test]
    async fn append_to_missing_session_is_not_found() {
        let s = SqliteStore::new(":memory:").await.unwrap();
        let err = s
            .append_message("nope", &ChatMessage::new(Role::User, "hi"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn update_unknown_message_is_not_found() {
        let s = store_with_session().await;
        let err = s
            .update_message("s1", &ChatMessage::new(Role::Assistant, "x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let s = SqliteStore::new(":memory:").await.unwrap();
        assert!(s.session("s404").await.unwrap().is_none());
    }
}
