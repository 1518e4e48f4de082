//! Typed carriers for the payload endpoints.
//!
//! These only build requests and decode answers; every call goes through
//! `Gateway::call` and so follows the same refresh rules.

use reqwest::header::HeaderValue;
use tracing::debug;

use super::{ApiError, ApiRequest, Gateway};
use crate::models::{
    ChatMessage, Comment, Like, NewChatMessage, NewComment, NewPost, Post, PostChanges, UploadedFile,
};

impl Gateway {
    /// Fetch the feed
    pub async fn list_posts(&self) -> Result<Vec<Post>, ApiError> {
        self.get_json("/posts").await
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Post, ApiError> {
        self.get_json(&format!("/posts/{}", post_id)).await
    }

    pub async fn create_post(&self, post: &NewPost) -> Result<Post, ApiError> {
        self.post_json("/posts", post).await
    }

    pub async fn update_post(&self, post_id: &str, changes: &PostChanges) -> Result<Post, ApiError> {
        self.put_json(&format!("/posts/{}", post_id), changes).await
    }

    pub async fn comments_for_post(&self, post_id: &str) -> Result<Vec<Comment>, ApiError> {
        self.get_json(&format!("/comments/post/{}", post_id)).await
    }

    pub async fn create_comment(&self, comment: &NewComment) -> Result<Comment, ApiError> {
        self.post_json("/comments", comment).await
    }

    pub async fn like_post(&self, post_id: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post("/likes").json(&serde_json::json!({ "postId": post_id }))?;
        self.call(request).await.map(|_| ())
    }

    pub async fn unlike_post(&self, post_id: &str) -> Result<(), ApiError> {
        self.delete(&format!("/likes/{}", post_id)).await
    }

    /// The like `user_id` left on `post_id`, if any.
    pub async fn like_by_owner(&self, post_id: &str, user_id: &str) -> Result<Option<Like>, ApiError> {
        match self.get_json(&format!("/likes/{}/{}", post_id, user_id)).await {
            Ok(like) => Ok(Some(like)),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn send_chat_message(&self, message: &NewChatMessage) -> Result<ChatMessage, ApiError> {
        self.post_json("/chat", message).await
    }

    /// Pass raw file bytes through to `/file`.
    pub async fn upload_file(
        &self,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadedFile, ApiError> {
        HeaderValue::from_str(content_type)
            .map_err(|_| ApiError::InvalidRequest(format!("Invalid content type: {}", content_type)))?;
        debug!(file = file_name, bytes = data.len(), "Uploading file");

        let request = ApiRequest::post("/file")
            .query("file", file_name)
            .bytes(content_type, data);
        self.call(request).await?.json()
    }
}
