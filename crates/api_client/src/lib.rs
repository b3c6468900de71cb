use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use core_types::{
    AccessToken, ApiError, ApiResult, EdgeId, FileId, FilePositionUpdate, FileRecord, FileUpload,
    GraphApi, GraphEdge, GraphEdgeCreate, GraphEdgeUpdate, GraphNode, Note, NoteCreate, NoteId,
    NoteUpdate, Page, Position, RagAnswer, SearchResponse, TokenSource, User,
};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

pub struct HttpGraphApi {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpGraphApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            tokens,
        }
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        timeout: Option<Duration>,
    ) -> ApiResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(transport)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Registers a new account. The backend answers 400 when the email is
    /// already taken; no token is issued, so a login has to follow.
    pub async fn signup(&self, email: &str, password: &str) -> ApiResult<User> {
        let builder = self
            .request(Method::POST, "users/")?
            .json(&json!({ "email": email, "password": password }));
        self.send_json(builder).await
    }

    /// Exchanges credentials for a bearer token (`/login/access-token`).
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<AccessToken> {
        let builder = self
            .request(Method::POST, "login/access-token")?
            .form(&[("username", email), ("password", password)]);
        self.send_json(builder).await
    }

    /// Current user, or `None` when the backend rejects the token.
    pub async fn current_user(&self) -> ApiResult<Option<User>> {
        let builder = self.request(Method::GET, "users/me")?;
        match self.send_json::<User>(builder).await {
            Ok(user) => Ok(Some(user)),
            Err(err) if err.is_unauthorized() => {
                debug!("current user lookup rejected with 401");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    fn auth_headers(&self) -> ApiResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = self.tokens.bearer_token() {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                    .map_err(|_| ApiError::InvalidRequest("invalid authorization header".into()))?,
            );
        }
        Ok(headers)
    }

    fn request(&self, method: Method, path: &str) -> ApiResult<RequestBuilder> {
        debug!(%method, path, "backend request");
        Ok(self
            .client
            .request(method, self.url(path))
            .headers(self.auth_headers()?))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let response = checked(builder.send().await.map_err(transport)?).await?;
        let text = response.text().await.map_err(transport)?;
        serde_json::from_str(&text).map_err(|err| ApiError::Decode(err.to_string()))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> ApiResult<()> {
        checked(builder.send().await.map_err(transport)?).await?;
        Ok(())
    }
}

#[async_trait]
impl GraphApi for HttpGraphApi {
    async fn list_graph_nodes(&self) -> ApiResult<Vec<GraphNode>> {
        let builder = self
            .request(Method::GET, "graph/nodes/")?
            .query(&[("skip", 0u32), ("limit", 1000)]);
        self.send_json(builder).await
    }

    async fn list_graph_edges(&self) -> ApiResult<Vec<GraphEdge>> {
        let builder = self
            .request(Method::GET, "graph/edges/")?
            .query(&[("skip", 0u32), ("limit", 1000)]);
        self.send_json(builder).await
    }

    async fn list_notes(&self, skip: u32, limit: u32) -> ApiResult<Page<Note>> {
        let builder = self
            .request(Method::GET, "notes/")?
            .query(&[("skip", skip), ("limit", limit)]);
        self.send_json(builder).await
    }

    async fn create_note(&self, note: &NoteCreate) -> ApiResult<Note> {
        let builder = self.request(Method::POST, "notes/")?.json(note);
        self.send_json(builder).await
    }

    async fn update_note(&self, note_id: NoteId, update: &NoteUpdate) -> ApiResult<Note> {
        let builder = self
            .request(Method::PUT, &format!("notes/{note_id}"))?
            .json(update);
        self.send_json(builder).await
    }

    async fn delete_note(&self, note_id: NoteId) -> ApiResult<()> {
        let builder = self.request(Method::DELETE, &format!("notes/{note_id}"))?;
        self.send_empty(builder).await
    }

    async fn list_files(&self, skip: u32, limit: u32) -> ApiResult<Page<FileRecord>> {
        let builder = self
            .request(Method::GET, "files/")?
            .query(&[("skip", skip), ("limit", limit)]);
        self.send_json(builder).await
    }

    async fn upload_file(&self, upload: FileUpload) -> ApiResult<FileRecord> {
        let mut part = reqwest::multipart::Part::bytes(upload.bytes).file_name(upload.filename);
        if let Some(mime_type) = upload.mime_type.as_deref() {
            part = part
                .mime_str(mime_type)
                .map_err(|_| ApiError::InvalidRequest(format!("invalid mime type {mime_type}")))?;
        }
        let form = reqwest::multipart::Form::new().part("file", part);
        let builder = self.request(Method::POST, "files/upload")?.multipart(form);
        self.send_json(builder).await
    }

    async fn update_file_position(
        &self,
        file_id: FileId,
        position: Position,
    ) -> ApiResult<GraphNode> {
        let builder = self
            .request(Method::PUT, &format!("files/{file_id}/position"))?
            .json(&FilePositionUpdate::from(position));
        self.send_json(builder).await
    }

    async fn delete_file(&self, file_id: FileId) -> ApiResult<()> {
        let builder = self.request(Method::DELETE, &format!("files/{file_id}"))?;
        self.send_empty(builder).await
    }

    async fn download_file(&self, file_id: FileId) -> ApiResult<Vec<u8>> {
        let builder = self.request(Method::GET, &format!("files/{file_id}/download"))?;
        let response = checked(builder.send().await.map_err(transport)?).await?;
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }

    async fn create_edge(&self, edge: &GraphEdgeCreate) -> ApiResult<GraphEdge> {
        let builder = self.request(Method::POST, "graph/edges/")?.json(edge);
        self.send_json(builder).await
    }

    async fn update_edge(&self, edge_id: EdgeId, update: &GraphEdgeUpdate) -> ApiResult<GraphEdge> {
        let builder = self
            .request(Method::PUT, &format!("graph/edges/{edge_id}"))?
            .json(update);
        self.send_json(builder).await
    }

    async fn delete_edge(&self, edge_id: EdgeId) -> ApiResult<()> {
        let builder = self.request(Method::DELETE, &format!("graph/edges/{edge_id}"))?;
        self.send_empty(builder).await
    }

    async fn search_notes(&self, query: &str, top_k: u32) -> ApiResult<SearchResponse> {
        let top_k = top_k.clamp(1, 20).to_string();
        let builder = self
            .request(Method::GET, "ai/search-notes")?
            .query(&[("query", query), ("top_k", top_k.as_str())]);
        self.send_json(builder).await
    }

    async fn rag_query(&self, query: &str) -> ApiResult<RagAnswer> {
        let builder = self
            .request(Method::POST, "ai/rag-query")?
            .json(&json!({ "query": query }));
        self.send_json(builder).await
    }
}

async fn checked(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let detail = error_detail(status, &text);
    warn!(status = status.as_u16(), %detail, "backend request failed");
    Err(ApiError::Status {
        status: status.as_u16(),
        detail,
    })
}

/// Pulls a readable message out of a FastAPI-style `{"detail": ...}` body.
fn error_detail(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match value.get("detail") {
            Some(Value::String(detail)) => return detail.clone(),
            Some(Value::Array(items)) => {
                let messages: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(Value::as_str))
                    .collect();
                if !messages.is_empty() {
                    return messages.join("; ");
                }
            }
            _ => {}
        }
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.to_string()
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn transport(err: reqwest::Error) -> ApiError {
    ApiError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    struct StaticToken(Option<String>);

    impl TokenSource for StaticToken {
        fn bearer_token(&self) -> Option<String> {
            self.0.clone()
        }
    }

    /// Serves one canned response and hands back the raw request text.
    fn serve_once(status_line: &str, body: &str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
            let _ = tx.send(request);
        });
        (format!("http://127.0.0.1:{port}/api/v1"), rx)
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0_u8; 1024];
        loop {
            let read = stream.read(&mut chunk).unwrap_or(0);
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    #[test]
    fn joins_urls_without_double_slashes() {
        assert_eq!(
            join_url("http://h/api/v1/", "/notes/"),
            "http://h/api/v1/notes/"
        );
        assert_eq!(join_url("http://h/api/v1", "graph/edges/3"), "http://h/api/v1/graph/edges/3");
    }

    #[test]
    fn extracts_error_detail() {
        assert_eq!(
            error_detail(StatusCode::NOT_FOUND, r#"{"detail":"Edge not found"}"#),
            "Edge not found"
        );
        assert_eq!(
            error_detail(
                StatusCode::UNPROCESSABLE_ENTITY,
                r#"{"detail":[{"msg":"field required"},{"msg":"value is not a valid integer"}]}"#
            ),
            "field required; value is not a valid integer"
        );
        assert_eq!(
            error_detail(StatusCode::INTERNAL_SERVER_ERROR, ""),
            "Internal Server Error"
        );
        assert_eq!(error_detail(StatusCode::BAD_GATEWAY, "upstream down"), "upstream down");
    }

    #[tokio::test]
    async fn attaches_bearer_token_and_decodes_edge() {
        let body = r#"{"id":5,"user_id":1,"source_node_id":1,"target_node_id":2,"relationship_type":"related","data":null,"created_at":"2024-05-01T10:00:00","updated_at":null}"#;
        let (base_url, requests) = serve_once("201 Created", body);
        let api = HttpGraphApi::new(base_url, Arc::new(StaticToken(Some("tok".into()))));

        let edge = api
            .create_edge(&GraphEdgeCreate {
                source_node_id: 1,
                target_node_id: 2,
                relationship_type: None,
                data: None,
            })
            .await
            .expect("create edge");
        assert_eq!(edge.id, 5);

        let request = requests.recv().expect("request").to_lowercase();
        assert!(request.starts_with("post /api/v1/graph/edges/ "), "{request}");
        assert!(request.contains("authorization: bearer tok"), "{request}");
        assert!(request.contains(r#""source_node_id":1"#), "{request}");
    }

    #[tokio::test]
    async fn proceeds_without_token_and_maps_server_errors() {
        let (base_url, requests) =
            serve_once("500 Internal Server Error", r#"{"detail":"boom"}"#);
        let api = HttpGraphApi::new(base_url, Arc::new(StaticToken(None)));

        let err = api.delete_edge(9).await.expect_err("must fail");
        assert_eq!(
            err,
            ApiError::Status {
                status: 500,
                detail: "boom".to_string()
            }
        );

        let request = requests.recv().expect("request").to_lowercase();
        assert!(request.starts_with("delete /api/v1/graph/edges/9 "), "{request}");
        assert!(!request.contains("authorization:"), "{request}");
    }

    fn anonymous(base_url: String) -> HttpGraphApi {
        HttpGraphApi::new(base_url, Arc::new(StaticToken(None)))
    }

    fn body_of(request: &str) -> &str {
        request
            .split_once("\r\n\r\n")
            .map(|(_, body)| body)
            .unwrap_or("")
    }

    #[tokio::test]
    async fn signup_posts_json_credentials() {
        let (base_url, requests) = serve_once(
            "200 OK",
            r#"{"id":7,"email":"ada@example.test","is_active":true,"created_at":"2024-05-01T10:00:00"}"#,
        );
        let user = anonymous(base_url)
            .signup("ada@example.test", "hunter2")
            .await
            .expect("signup");
        assert_eq!(user.id, 7);
        assert_eq!(user.email, "ada@example.test");

        let request = requests.recv().expect("request");
        assert!(request.starts_with("POST /api/v1/users/ "), "{request}");
        let body: Value = serde_json::from_str(body_of(&request)).expect("json body");
        assert_eq!(body, json!({"email": "ada@example.test", "password": "hunter2"}));
    }

    #[tokio::test]
    async fn signup_surfaces_duplicate_email() {
        let (base_url, _requests) = serve_once(
            "400 Bad Request",
            r#"{"detail":"The user with this email already exists in the system."}"#,
        );
        let err = anonymous(base_url)
            .signup("ada@example.test", "hunter2")
            .await
            .expect_err("must fail");
        assert_eq!(
            err,
            ApiError::Status {
                status: 400,
                detail: "The user with this email already exists in the system.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn login_sends_form_encoded_credentials() {
        let (base_url, requests) =
            serve_once("200 OK", r#"{"access_token":"abc","token_type":"bearer"}"#);
        let token = anonymous(base_url)
            .login("ada@example.test", "pw")
            .await
            .expect("login");
        assert_eq!(token.access_token, "abc");

        let request = requests.recv().expect("request");
        assert!(request.starts_with("POST /api/v1/login/access-token "), "{request}");
        assert!(
            request
                .to_lowercase()
                .contains("content-type: application/x-www-form-urlencoded"),
            "{request}"
        );
        assert_eq!(body_of(&request), "username=ada%40example.test&password=pw");
    }

    #[tokio::test]
    async fn upload_sends_multipart_file_field() {
        let body = r#"{"id":4,"user_id":1,"filename":"report.pdf","mime_type":"application/pdf","size":4,"created_at":"2024-05-01T10:00:00"}"#;
        let (base_url, requests) = serve_once("200 OK", body);
        let file = anonymous(base_url)
            .upload_file(FileUpload {
                filename: "report.pdf".to_string(),
                mime_type: Some("application/pdf".to_string()),
                bytes: b"%PDF".to_vec(),
            })
            .await
            .expect("upload");
        assert_eq!(file.id, 4);
        assert_eq!(file.graph_node_id, None);

        let request = requests.recv().expect("request");
        assert!(request.starts_with("POST /api/v1/files/upload "), "{request}");
        assert!(
            request
                .to_lowercase()
                .contains("content-type: multipart/form-data; boundary="),
            "{request}"
        );
        let body = body_of(&request);
        assert!(
            body.contains(r#"Content-Disposition: form-data; name="file"; filename="report.pdf""#),
            "{body}"
        );
        assert!(body.contains("Content-Type: application/pdf"), "{body}");
        assert!(body.contains("%PDF"), "{body}");
    }

    #[tokio::test]
    async fn rejects_malformed_mime_type_before_sending() {
        let api = anonymous("http://127.0.0.1:9/api/v1".to_string());
        let err = api
            .upload_file(FileUpload {
                filename: "a.bin".to_string(),
                mime_type: Some("not a mime".to_string()),
                bytes: Vec::new(),
            })
            .await
            .expect_err("must fail");
        assert!(matches!(err, ApiError::InvalidRequest(_)), "{err:?}");
    }

    #[tokio::test]
    async fn file_position_is_sent_as_flat_coordinates() {
        let body = r#"{"id":12,"user_id":1,"label":"report.pdf","node_type":"file","data":{"original_file_id":4},"position":{"x":120.5,"y":-8.0},"created_at":"2024-05-01T10:00:00"}"#;
        let (base_url, requests) = serve_once("200 OK", body);
        let node = anonymous(base_url)
            .update_file_position(4, Position::new(120.5, -8.0))
            .await
            .expect("position");
        assert_eq!(node.id, 12);

        let request = requests.recv().expect("request");
        assert!(request.starts_with("PUT /api/v1/files/4/position "), "{request}");
        let body: Value = serde_json::from_str(body_of(&request)).expect("json body");
        assert_eq!(body, json!({"position_x": 120.5, "position_y": -8.0}));
    }

    #[tokio::test]
    async fn note_update_sends_only_present_fields() {
        let body = r#"{"id":3,"user_id":1,"title":"T","content":"new","created_at":"2024-05-01T10:00:00"}"#;
        let (base_url, requests) = serve_once("200 OK", body);
        let note = anonymous(base_url)
            .update_note(3, &NoteUpdate::content("new"))
            .await
            .expect("update");
        assert_eq!(note.content.as_deref(), Some("new"));

        let request = requests.recv().expect("request");
        assert!(request.starts_with("PUT /api/v1/notes/3 "), "{request}");
        let body: Value = serde_json::from_str(body_of(&request)).expect("json body");
        assert_eq!(body, json!({"content": "new"}));
    }

    #[tokio::test]
    async fn search_clamps_top_k() {
        for (requested, sent) in [(50, "top_k=20"), (0, "top_k=1"), (5, "top_k=5")] {
            let (base_url, requests) = serve_once("200 OK", r#"{"query":"milk","results":[]}"#);
            let response = anonymous(base_url)
                .search_notes("milk eggs", requested)
                .await
                .expect("search");
            assert!(response.results.is_empty());

            let request = requests.recv().expect("request");
            let request_line = request.lines().next().unwrap_or_default();
            assert!(
                request_line.starts_with("GET /api/v1/ai/search-notes?query=milk+eggs&"),
                "{request_line}"
            );
            assert!(request_line.contains(sent), "{request_line}");
        }
    }

    #[tokio::test]
    async fn rag_query_posts_question() {
        let (base_url, requests) = serve_once(
            "200 OK",
            r#"{"answer":"Milk","sources":[{"note_id":3,"title":"Shopping"}]}"#,
        );
        let answer = anonymous(base_url)
            .rag_query("what to buy?")
            .await
            .expect("ask");
        assert_eq!(answer.answer, "Milk");
        assert_eq!(answer.sources[0].note_id, Some(3));

        let request = requests.recv().expect("request");
        assert!(request.starts_with("POST /api/v1/ai/rag-query "), "{request}");
        let body: Value = serde_json::from_str(body_of(&request)).expect("json body");
        assert_eq!(body, json!({"query": "what to buy?"}));
    }

    #[tokio::test]
    async fn list_notes_passes_paging() {
        let (base_url, requests) = serve_once("200 OK", r#"{"items":[],"total":0}"#);
        let page = anonymous(base_url).list_notes(20, 10).await.expect("list");
        assert_eq!(page.total, 0);

        let request = requests.recv().expect("request");
        assert!(request.starts_with("GET /api/v1/notes/?skip=20&limit=10 "), "{request}");
    }

    #[tokio::test]
    async fn download_returns_raw_bytes() {
        let (base_url, requests) = serve_once("200 OK", "raw file body");
        let bytes = anonymous(base_url).download_file(4).await.expect("download");
        assert_eq!(bytes, b"raw file body");

        let request = requests.recv().expect("request");
        assert!(request.starts_with("GET /api/v1/files/4/download "), "{request}");
    }

    #[tokio::test]
    async fn current_user_is_none_on_unauthorized() {
        let (base_url, _requests) =
            serve_once("401 Unauthorized", r#"{"detail":"Could not validate credentials"}"#);
        let api = HttpGraphApi::new(base_url, Arc::new(StaticToken(Some("stale".into()))));
        assert_eq!(api.current_user().await.expect("lookup"), None);
    }
}
