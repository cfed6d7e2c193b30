use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::shared::error::{Result, SandboxError};
use crate::shared::models::{Conversation, Document, DocumentSnapshot, Message, MessageRole};

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<String, Conversation>,
    documents: HashMap<String, Document>,
    next_seq: u64,
}

/// Process-local store of conversations, messages and document metadata,
/// keyed by owning session. Volatile by design: a process restart yields
/// empty storage.
///
/// One mutex spans each logical unit of work, so "insert message + bump
/// conversation timestamp" commits atomically and readers never observe a
/// half-written message.
pub struct EphemeralStore {
    inner: Mutex<StoreInner>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn create_conversation(&self, session_id: &str) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        };

        let mut inner = self.inner.lock().expect("store lock");
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        conversation
    }

    /// Append a message. Assigns the next monotonic sequence id and bumps
    /// the conversation's updated timestamp in the same critical section.
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        document_ids: Vec<String>,
        document_contents: HashMap<String, DocumentSnapshot>,
    ) -> Result<Message> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.next_seq += 1;
        let seq = inner.next_seq;

        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| SandboxError::NotFound(format!("conversation {conversation_id}")))?;

        let timestamp = Utc::now();
        let message = Message {
            seq,
            role,
            content: content.to_string(),
            timestamp,
            document_ids,
            document_contents,
        };
        conversation.messages.push(message.clone());
        conversation.updated_at = timestamp;

        Ok(message)
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let inner = self.inner.lock().expect("store lock");
        inner.conversations.get(conversation_id).cloned()
    }

    /// Conversations for a session, most recently updated first.
    pub fn list_conversations(&self, session_id: &str) -> Vec<Conversation> {
        let inner = self.inner.lock().expect("store lock");
        let mut conversations: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations
    }

    /// Delete a conversation and its messages. Returns false when the
    /// conversation does not exist or is owned by another session; the two
    /// cases are indistinguishable to the caller.
    pub fn delete_conversation(&self, conversation_id: &str, session_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("store lock");
        let owned = inner
            .conversations
            .get(conversation_id)
            .map(|c| c.session_id == session_id)
            .unwrap_or(false);
        if owned {
            inner.conversations.remove(conversation_id);
        }
        owned
    }

    pub fn add_document(
        &self,
        session_id: &str,
        filename: &str,
        file_path: &str,
        file_size: u64,
        file_type: &str,
    ) -> Document {
        let document = Document {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            filename: filename.to_string(),
            file_path: file_path.to_string(),
            file_size,
            file_type: file_type.to_string(),
            uploaded_at: Utc::now(),
            processed_at: None,
            processed_content: None,
            processing_error: None,
            page_count: None,
            word_count: None,
        };

        let mut inner = self.inner.lock().expect("store lock");
        inner
            .documents
            .insert(document.id.clone(), document.clone());
        document
    }

    /// Record the outcome of document processing. At most one attempt is
    /// recorded; a second call leaves the first result untouched.
    pub fn update_document_processing(
        &self,
        document_id: &str,
        processed_content: Option<String>,
        processing_error: Option<String>,
        page_count: Option<u32>,
        word_count: Option<u32>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let document = inner
            .documents
            .get_mut(document_id)
            .ok_or_else(|| SandboxError::NotFound(format!("document {document_id}")))?;

        if document.processed_at.is_some() {
            warn!("Document {} already has a processing result", document_id);
            return Ok(());
        }

        document.processed_at = Some(Utc::now());
        document.processed_content = processed_content;
        document.processing_error = processing_error;
        document.page_count = page_count;
        document.word_count = word_count;
        Ok(())
    }

    pub fn get_document(&self, document_id: &str) -> Option<Document> {
        let inner = self.inner.lock().expect("store lock");
        inner.documents.get(document_id).cloned()
    }

    /// Documents for a session, newest upload first.
    pub fn list_documents(&self, session_id: &str) -> Vec<Document> {
        let inner = self.inner.lock().expect("store lock");
        let mut documents: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| d.session_id == session_id)
            .cloned()
            .collect();
        documents.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        documents
    }

    /// Delete a document and its backing file. Same ownership rule as
    /// conversations. Messages citing the document keep their snapshots;
    /// their references simply dangle.
    pub fn delete_document(&self, document_id: &str, session_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("store lock");
            let owned = inner
                .documents
                .get(document_id)
                .map(|d| d.session_id == session_id)
                .unwrap_or(false);
            if owned {
                inner.documents.remove(document_id)
            } else {
                None
            }
        };

        match removed {
            Some(document) => {
                remove_backing_file(&document.file_path);
                true
            }
            None => false,
        }
    }

    /// Cascade-delete everything a session owns, backing files included.
    pub fn clear_session(&self, session_id: &str) {
        let removed_files: Vec<String> = {
            let mut inner = self.inner.lock().expect("store lock");
            inner.conversations.retain(|_, c| c.session_id != session_id);

            let doomed: Vec<String> = inner
                .documents
                .values()
                .filter(|d| d.session_id == session_id)
                .map(|d| d.id.clone())
                .collect();
            doomed
                .iter()
                .filter_map(|id| inner.documents.remove(id))
                .map(|d| d.file_path)
                .collect()
        };

        for path in removed_files {
            remove_backing_file(&path);
        }
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_backing_file(path: &str) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove document file {}: {}", path, e);
        }
    }
}
