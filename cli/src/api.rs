use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use fittrack_core::chat::{ByteStream, ChatReply, ChatTransport};
use fittrack_core::error::{ApiError, error_body_message};
use fittrack_core::meal_plans::MealPlanRemote;
use fittrack_core::models::{MealPlanListResponse, MealPlanResponse, NewMealPlan, UpdateMealPlan};
use fittrack_core::nutrition::{Envelope, MacroPlan, NutritionProfile, NutritionRemote};

use crate::config::TokenStore;

const CHAT_PATH: &str = "/api/chatbot/send";
const MEAL_PLANS_PATH: &str = "/api/nutrition/meal-plans";
const PROFILE_PATH: &str = "/api/nutrition/profile";
const CALCULATE_PATH: &str = "/api/nutrition/calculate-macros";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the fittrack backend.
///
/// Ordinary calls get the bearer token attached here. Any 401 clears the
/// stored token before the error reaches the caller.
pub struct ApiClient {
    client: reqwest::Client,
    /// Chat only. No overall timeout: an assistant reply, buffered or streamed,
    /// can take longer than any ordinary request should.
    chat_client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
}

impl ApiClient {
    pub fn new(base_url: &str, tokens: Arc<TokenStore>) -> Result<Self> {
        let user_agent = format!("fittrack-cli/{}", env!("CARGO_PKG_VERSION"));
        let client = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let chat_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            chat_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.with_token(self.client.request(method, self.url(path)))
    }

    fn with_token(&self, req: RequestBuilder) -> RequestBuilder {
        match self.tokens.get() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await.map_err(transport_error)?;
        self.check_status(resp).await
    }

    /// Pass 2xx responses through; turn everything else into an `ApiError`.
    async fn check_status(&self, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let path = resp.url().path().to_string();
        let body = resp.text().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED {
            warn!(%path, "server rejected credentials, logging out");
            if let Err(e) = self.tokens.clear() {
                warn!(error = %e, "could not clear stored token");
            }
            return Err(ApiError::Unauthorized.into());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                what: path,
                message: error_body_message(&body),
            }
            .into());
        }
        debug!(%path, status = status.as_u16(), "request failed");
        Err(ApiError::from_status_body(status.as_u16(), &body).into())
    }

    async fn json_value(&self, req: RequestBuilder) -> Result<Value> {
        let resp = self.execute(req).await?;
        resp.json()
            .await
            .map_err(|e| ApiError::UnexpectedShape(format!("response was not JSON: {e}")).into())
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Value> {
        self.json_value(self.request(method, path).json(body)).await
    }
}

fn transport_error(e: reqwest::Error) -> anyhow::Error {
    if e.is_timeout() {
        ApiError::Timeout(REQUEST_TIMEOUT).into()
    } else {
        ApiError::Transport(e.to_string()).into()
    }
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::UnexpectedShape(format!("{what}: {e}")).into())
}

#[async_trait]
impl ChatTransport for ApiClient {
    async fn send_buffered(&self, message: &str) -> Result<ChatReply> {
        let body = json!({ "message": message, "stream": false });
        let req = self.with_token(self.chat_client.post(self.url(CHAT_PATH)).json(&body));
        let value = self.json_value(req).await?;
        decode(value, "chat reply")
    }

    async fn open_stream(&self, message: &str) -> Result<ByteStream> {
        let mut req = self
            .chat_client
            .post(self.url(CHAT_PATH))
            .header(ACCEPT, "text/event-stream")
            .json(&json!({ "message": message, "stream": true }));
        if let Some(token) = self.tokens.get() {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let resp = req.send().await.map_err(transport_error)?;
        let resp = self.check_status(resp).await?;
        let stream = resp.bytes_stream().map(|chunk| {
            chunk.map_err(|e| anyhow::Error::from(ApiError::Transport(e.to_string())))
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl MealPlanRemote for ApiClient {
    async fn list(&self) -> Result<MealPlanListResponse> {
        let value = self
            .json_value(self.request(Method::GET, MEAL_PLANS_PATH))
            .await?;
        MealPlanListResponse::from_value(value)
    }

    async fn get(&self, id: &str) -> Result<MealPlanResponse> {
        let path = format!("{MEAL_PLANS_PATH}/{id}");
        let value = self.json_value(self.request(Method::GET, &path)).await?;
        MealPlanResponse::from_value(value)
    }

    async fn create(&self, data: &NewMealPlan) -> Result<MealPlanResponse> {
        let value = self.send_json(Method::POST, MEAL_PLANS_PATH, data).await?;
        MealPlanResponse::from_value(value)
    }

    async fn update(&self, id: &str, data: &UpdateMealPlan) -> Result<MealPlanResponse> {
        let path = format!("{MEAL_PLANS_PATH}/{id}");
        let value = self.send_json(Method::PUT, &path, data).await?;
        MealPlanResponse::from_value(value)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = format!("{MEAL_PLANS_PATH}/{id}");
        self.execute(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }
}

#[async_trait]
impl NutritionRemote for ApiClient {
    async fn profile(&self) -> Result<Envelope<NutritionProfile>> {
        let value = self
            .json_value(self.request(Method::GET, PROFILE_PATH))
            .await?;
        decode(value, "nutrition profile")
    }

    async fn calculate(&self, profile: &NutritionProfile) -> Result<Envelope<MacroPlan>> {
        let value = self
            .send_json(Method::POST, CALCULATE_PATH, profile)
            .await?;
        decode(value, "macro calculation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Json, Path};
    use axum::http::{HeaderMap, StatusCode as AxumStatus, header};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use fittrack_core::chat::{ChatRole, ChatSession};
    use fittrack_core::db::Database;
    use fittrack_core::meal_plans::{DataSource, MealPlanService};
    use fittrack_core::models::EntityId;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: &str, dir: &tempfile::TempDir, token: Option<&str>) -> ApiClient {
        let path = dir.path().join("token");
        if let Some(t) = token {
            std::fs::write(&path, t).unwrap();
        }
        let tokens = Arc::new(TokenStore::new(path, token.map(str::to_string)));
        ApiClient::new(base, tokens).unwrap()
    }

    fn bearer(headers: &HeaderMap) -> String {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn test_buffered_chat_sends_bearer_and_maps_roles() {
        let router = Router::new().route(
            CHAT_PATH,
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(body["stream"], json!(false));
                Json(json!({
                    "success": true,
                    "responses": [
                        { "role": "tool", "content": format!("auth={}", bearer(&headers)) },
                        { "role": "assistant", "content": format!("echo: {}", body["message"].as_str().unwrap()) }
                    ]
                }))
            }),
        );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let session = ChatSession::new(client(&base, &dir, Some("tok-1")));

        session.send("hello", false).await;

        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, ChatRole::System);
        assert_eq!(messages[1].content, "auth=Bearer tok-1");
        assert_eq!(messages[2].content, "echo: hello");
    }

    #[tokio::test]
    async fn test_streamed_chat() {
        let router = Router::new().route(
            CHAT_PATH,
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(body["stream"], json!(true));
                assert_eq!(
                    headers.get(header::ACCEPT).unwrap().to_str().unwrap(),
                    "text/event-stream"
                );
                assert_eq!(bearer(&headers), "Bearer tok-2");
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    "data: {\"content\":\"Pro\"}\n\n\
                     data: not json\n\n\
                     data: {\"content\":\"Protein first.\"}\n\n\
                     data: {\"done\":true}\n\n",
                )
            }),
        );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let session = ChatSession::new(client(&base, &dir, Some("tok-2")));

        session.send("tips", true).await;

        let reply = &session.messages()[1];
        assert_eq!(reply.content, "Protein first.");
        assert!(!reply.is_streaming);
    }

    #[tokio::test]
    async fn test_buffered_chat_outlasts_request_timeout() {
        let router = Router::new().route(
            CHAT_PATH,
            post(|| async {
                tokio::time::sleep(REQUEST_TIMEOUT + Duration::from_secs(1)).await;
                Json(json!({ "success": true, "message": "Here is your week." }))
            }),
        );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let session = ChatSession::new(client(&base, &dir, None));

        session.send("plan my week", false).await;
        assert_eq!(session.messages()[1].content, "Here is your week.");
    }

    #[tokio::test]
    async fn test_chat_error_body_detail() {
        let router = Router::new().route(
            CHAT_PATH,
            post(|| async {
                (
                    AxumStatus::SERVICE_UNAVAILABLE,
                    Json(json!({ "detail": "Assistant is offline" })),
                )
            }),
        );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let session = ChatSession::new(client(&base, &dir, None));

        session.send("hi", false).await;
        assert_eq!(session.messages()[1].content, "Assistant is offline");
    }

    #[tokio::test]
    async fn test_401_clears_token() {
        let router = Router::new().route(
            MEAL_PLANS_PATH,
            get(|| async { (AxumStatus::UNAUTHORIZED, Json(json!({ "detail": "expired" }))) }),
        );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&base, &dir, Some("stale"));

        let err = MealPlanRemote::list(&api).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::Unauthorized)
        ));
        assert!(api.tokens.get().is_none());
        assert!(!dir.path().join("token").exists());
    }

    #[tokio::test]
    async fn test_meal_plan_envelopes() {
        let router = Router::new()
            .route(
                MEAL_PLANS_PATH,
                get(|| async {
                    Json(json!({ "meal_plans": [{ "id": 1, "name": "Server plan", "is_active": true }] }))
                })
                .post(|Json(body): Json<Value>| async move {
                    Json(json!({ "success": true, "data": { "id": 9, "name": body["name"] } }))
                }),
            )
            .route(
                "/api/nutrition/meal-plans/{id}",
                get(|Path(id): Path<String>| async move {
                    if id == "1" {
                        let body = json!({ "meal_plan": { "id": 1, "name": "Server plan" } });
                        Json(body).into_response()
                    } else {
                        let body = json!({ "detail": "Not found" });
                        (AxumStatus::NOT_FOUND, Json(body)).into_response()
                    }
                })
                .put(|Path(id): Path<String>, Json(body): Json<Value>| async move {
                    Json(json!({ "id": id, "name": "Server plan", "description": body["description"] }))
                })
                .delete(|| async { AxumStatus::NO_CONTENT }),
            );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&base, &dir, None);

        let plans = MealPlanRemote::list(&api)
            .await
            .unwrap()
            .into_plans(true)
            .unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].id, EntityId::Remote("1".to_string()));

        let created = MealPlanRemote::create(
            &api,
            &NewMealPlan {
                name: "Bulk".into(),
                ..NewMealPlan::default()
            },
        )
        .await
        .unwrap()
        .into_plan()
        .unwrap();
        assert_eq!(created.id.as_str(), "9");
        assert_eq!(created.name, "Bulk");

        let update = UpdateMealPlan {
            description: Some(None),
            ..UpdateMealPlan::default()
        };
        let updated = MealPlanRemote::update(&api, "1", &update)
            .await
            .unwrap()
            .into_plan()
            .unwrap();
        assert!(updated.description.is_none());

        let missing = MealPlanRemote::get(&api, "404").await.unwrap_err();
        assert!(fittrack_core::error::is_not_found(&missing));
        assert_eq!(
            missing.downcast_ref::<ApiError>().unwrap().user_message(),
            "Not found"
        );

        MealPlanRemote::delete(&api, "1").await.unwrap();
    }

    #[tokio::test]
    async fn test_service_falls_back_when_server_down() {
        // Nothing listens on this port once the listener is dropped
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let svc = MealPlanService::new(
            client(&base, &dir, None),
            Database::open_in_memory().unwrap(),
        );
        let plan = svc
            .create(&NewMealPlan {
                name: "Offline".into(),
                ..NewMealPlan::default()
            })
            .await
            .unwrap();
        assert!(plan.id.is_local());

        let list = svc.get_all(None).await.unwrap();
        assert_eq!(list.source, DataSource::Local);
        assert_eq!(list.plans.len(), 1);
    }

    #[tokio::test]
    async fn test_nutrition_endpoints() {
        let router = Router::new()
            .route(
                PROFILE_PATH,
                get(|| async {
                    Json(json!({ "success": true, "data": {
                        "age": 30, "sex": "male", "height_cm": 180, "weight_kg": 80,
                        "activity_level": "moderate", "goal": "maintain"
                    }}))
                }),
            )
            .route(
                CALCULATE_PATH,
                post(|| async {
                    Json(json!({ "calories": 2500, "protein_g": 190, "carbs_g": 250, "fat_g": 83 }))
                }),
            );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&base, &dir, None);

        let profile = NutritionRemote::profile(&api)
            .await
            .unwrap()
            .into_inner()
            .unwrap();
        assert_eq!(profile.age, 30);

        let plan = NutritionRemote::calculate(&api, &profile)
            .await
            .unwrap()
            .into_inner()
            .unwrap();
        assert!((plan.target_calories - 2500.0).abs() < 0.01);
    }
}
