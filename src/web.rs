use crate::{
    app::{AppError, AppLocal, CreateBookmark},
    auth,
    bookmarks::{Bookmark, BookmarkPage, BookmarkPatch, FolderFilter, ListQuery},
    collections::{Collection, CollectionCreate, CollectionDetail, CollectionUpdate},
    config::UserConfig,
    eid::Eid,
    folders::{Folder, FolderCreate, FolderUpdate},
    import::{ImportJobView, ImportRequest, ImportSubmitted, ItemsQuery},
    public::PublicBookmarks,
    search::{SearchQuery, SearchResponse, DEFAULT_HISTORY_LIMIT, MAX_LIMIT},
};
use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{signal, sync::RwLock};
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Clone)]
pub struct SharedState {
    app: Arc<RwLock<AppLocal>>,
}

pub fn router(app: Arc<RwLock<AppLocal>>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    let protected = Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/bookmarks", post(create_bookmark).get(list_bookmarks))
        .route("/api/bookmarks/import", post(submit_import).get(list_imports))
        .route(
            "/api/bookmarks/import/:job_id",
            get(import_status).delete(delete_import),
        )
        .route("/api/bookmarks/import/:job_id/stop", post(stop_import))
        .route(
            "/api/bookmarks/import/:job_id/items/:item_id/skip",
            post(skip_import_item),
        )
        .route(
            "/api/bookmarks/:id",
            get(get_bookmark).patch(update_bookmark).delete(delete_bookmark),
        )
        .route("/api/bookmarks/:id/access", post(track_access))
        .route("/api/bookmarks/:id/retry", post(retry_enrichment))
        .route("/api/search", get(search))
        .route("/api/search/history", get(search_history))
        .route("/api/stats/tags", get(tag_stats))
        .route("/api/folders", get(list_folders).post(create_folder))
        .route(
            "/api/folders/:id",
            patch(update_folder).delete(delete_folder),
        )
        .route(
            "/api/collections",
            get(list_collections).post(create_collection),
        )
        .route(
            "/api/collections/:id",
            get(get_collection)
                .patch(update_collection)
                .delete(delete_collection),
        )
        .route(
            "/api/collections/:id/bookmarks",
            post(add_to_collection),
        )
        .route(
            "/api/collections/:id/bookmarks/:bookmark_id",
            delete(remove_from_collection),
        )
        .route(
            "/api/public/bookmarks/:id/visibility",
            patch(set_visibility),
        )
        .route(
            "/api/public/:handle/subscribers",
            get(list_subscribers),
        )
        .route(
            "/api/public/:handle/subscribers/:email",
            delete(remove_subscriber),
        )
        .route(
            "/api/public/:handle/subscription/check",
            get(subscription_check),
        )
        .route_layer(middleware::from_fn_with_state(
            shared_state.clone(),
            require_user,
        ));

    let open = Router::new()
        .route("/api/health", get(health))
        .route("/api/public/:handle/bookmarks", get(public_bookmarks))
        .route("/api/public/:handle/subscribe", post(subscribe))
        .route("/api/public/:handle/unsubscribe", post(unsubscribe))
        .route(
            "/api/public/:handle/subscribers/count",
            get(subscriber_count),
        );

    protected
        .merge(open)
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect::<Vec<_>>();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn start_app(app: AppLocal) -> anyhow::Result<()> {
    let (listen, cors_origins) = {
        let config = app.config();
        let config = config.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        (config.listen.clone(), config.cors_origins.clone())
    };

    let app = Arc::new(RwLock::new(app));
    let signal = shutdown_signal(app.clone());

    async fn shutdown_signal(app: Arc<RwLock<AppLocal>>) {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                log::error!("failed to install Ctrl+C handler: {err}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(err) => {
                    log::error!("failed to install signal handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let mut app = app.write().await;
        app.shutdown();

        // join on queue thread handle
        log::warn!("waiting for queues to stop");
        tokio::task::block_in_place(|| app.wait_task_queue_finish());
    }

    let router = router(app).layer(cors_layer(&cors_origins));

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await?;

    Ok(())
}

pub fn start_daemon(app: AppLocal) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(app).await })
}

#[derive(Debug)]
struct HttpError(AppError);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::SemanticDisabled => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Reqwest(_) | AppError::IO(_) | AppError::Json(_) | AppError::Other(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"error": self.0.to_string()}).to_string(),
        )
            .into_response()
    }
}

// This enables using `?` on functions that return `Result<_, AppError>`.
impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn resolve_user(state: &SharedState, headers: &HeaderMap) -> Option<UserConfig> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let config = state.app.read().await.config();
    let config = config.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    auth::resolve_user(&config, header)
}

/// Rejects requests without a valid bearer token and hands the user to handlers.
async fn require_user(
    State(state): State<Arc<SharedState>>,
    mut req: Request<Body>,
    next: Next,
) -> axum::response::Response {
    match resolve_user(&state, req.headers()).await {
        Some(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        None => HttpError(AppError::Unauthorized).into_response(),
    }
}

fn query_pairs(raw: Option<String>) -> Vec<(String, String)> {
    raw.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": "markly-api"}))
}

async fn me(Extension(user): Extension<UserConfig>) -> Json<Value> {
    Json(json!({
        "user": {
            "id": user.id,
            "username": user.username,
            "email": user.email,
            "full_name": user.full_name,
            "avatar_url": user.avatar_url,
        }
    }))
}

async fn create_bookmark(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Json(payload): Json<CreateBookmark>,
) -> Result<(StatusCode, Json<Value>), HttpError> {
    log::debug!("payload: {payload:?}");
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let (bookmark, already_exists) = app.create_bookmark(&user.id, payload)?;
        let status = if already_exists {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };

        Ok((
            status,
            Json(json!({"bookmark": bookmark, "already_exists": already_exists})),
        ))
    })
}

async fn list_bookmarks(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    RawQuery(raw): RawQuery,
) -> Result<Json<BookmarkPage>, HttpError> {
    let query = ListQuery::from_pairs(&query_pairs(raw))?;
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.list_bookmarks(&user.id, &query)))
    })
}

async fn get_bookmark(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
) -> Result<Json<Bookmark>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.get_bookmark(&user.id, &Eid::from(id))?))
    })
}

async fn update_bookmark(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
    Json(payload): Json<BookmarkPatch>,
) -> Result<Json<Bookmark>, HttpError> {
    log::debug!("payload: {payload:?}");
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.update_bookmark(&user.id, &Eid::from(id), payload)?))
    })
}

async fn delete_bookmark(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.delete_bookmark(&user.id, &Eid::from(id))?;
        Ok(Json(json!({"message": "Bookmark deleted"})))
    })
}

async fn track_access(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let access_count = app.track_access(&user.id, &Eid::from(id))?;
        Ok(Json(json!({"access_count": access_count})))
    })
}

async fn retry_enrichment(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let bookmark = app.retry_enrichment(&user.id, &Eid::from(id))?;
        Ok((
            StatusCode::ACCEPTED,
            Json(json!({"message": "Enrichment retry started", "bookmark": bookmark})),
        ))
    })
}

async fn submit_import(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Json(payload): Json<ImportRequest>,
) -> Result<(StatusCode, Json<ImportSubmitted>), HttpError> {
    log::debug!("import of {} bookmarks", payload.bookmarks.len());
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok((
            StatusCode::ACCEPTED,
            Json(app.submit_import(&user.id, payload)?),
        ))
    })
}

async fn list_imports(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(json!({"jobs": app.list_imports(&user.id)})))
    })
}

async fn import_status(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(job_id): Path<String>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<ImportJobView>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.import_status(&user.id, &Eid::from(job_id), &query)?))
    })
}

async fn stop_import(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let job = app.stop_import(&user.id, &Eid::from(job_id))?;
        Ok(Json(json!({"message": "Import stopped", "job": job})))
    })
}

#[derive(Debug, Deserialize)]
struct DeleteImportParams {
    #[serde(default)]
    remove_bookmarks: bool,
}

async fn delete_import(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(job_id): Path<String>,
    Query(params): Query<DeleteImportParams>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let removed = app.delete_import(&user.id, &Eid::from(job_id), params.remove_bookmarks)?;
        Ok(Json(
            json!({"message": "Import deleted", "removed_bookmarks": removed}),
        ))
    })
}

async fn skip_import_item(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path((job_id, item_id)): Path<(String, String)>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let item = app.skip_import_item(&user.id, &Eid::from(job_id), &Eid::from(item_id))?;
        Ok(Json(json!({"item": item})))
    })
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    RawQuery(raw): RawQuery,
) -> Result<Json<SearchResponse>, HttpError> {
    let query = SearchQuery::from_pairs(&query_pairs(raw))?;
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.search(&user.id, query)?))
    })
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
    folder_id: Option<String>,
}

async fn search_history(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        Ok(Json(json!({"history": app.search_history(&user.id, limit)})))
    })
}

async fn tag_stats(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, HttpError> {
    let folder = params
        .folder_id
        .as_deref()
        .map(str::parse::<FolderFilter>)
        .transpose()?;
    let limit = params.limit.unwrap_or(20).clamp(1, MAX_LIMIT);
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(
            json!({"tags": app.tag_stats(&user.id, folder.as_ref(), limit)}),
        ))
    })
}

async fn list_folders(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(json!({"folders": app.list_folders(&user.id)})))
    })
}

async fn create_folder(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Json(payload): Json<FolderCreate>,
) -> Result<(StatusCode, Json<Folder>), HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok((
            StatusCode::CREATED,
            Json(app.create_folder(&user.id, payload)?),
        ))
    })
}

async fn update_folder(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
    Json(payload): Json<FolderUpdate>,
) -> Result<Json<Folder>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.update_folder(&user.id, &Eid::from(id), payload)?))
    })
}

async fn delete_folder(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let unfiled = app.delete_folder(&user.id, &Eid::from(id))?;
        Ok(Json(
            json!({"message": "Folder deleted", "unfiled_bookmarks": unfiled}),
        ))
    })
}

async fn list_collections(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(json!({"collections": app.list_collections(&user.id)})))
    })
}

async fn get_collection(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
) -> Result<Json<CollectionDetail>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.get_collection(&user.id, &Eid::from(id))?))
    })
}

async fn create_collection(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Json(payload): Json<CollectionCreate>,
) -> Result<(StatusCode, Json<Collection>), HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok((
            StatusCode::CREATED,
            Json(app.create_collection(&user.id, payload)?),
        ))
    })
}

async fn update_collection(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
    Json(payload): Json<CollectionUpdate>,
) -> Result<Json<Collection>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.update_collection(&user.id, &Eid::from(id), payload)?))
    })
}

async fn delete_collection(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.delete_collection(&user.id, &Eid::from(id))?;
        Ok(Json(json!({"message": "Collection deleted"})))
    })
}

#[derive(Debug, Deserialize)]
struct CollectionMember {
    bookmark_id: String,
}

async fn add_to_collection(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
    Json(payload): Json<CollectionMember>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.add_to_collection(&user.id, &Eid::from(id), &Eid::from(payload.bookmark_id))?;
        Ok(Json(json!({"message": "Bookmark added to collection"})))
    })
}

async fn remove_from_collection(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path((id, bookmark_id)): Path<(String, String)>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.remove_from_collection(&user.id, &Eid::from(id), &Eid::from(bookmark_id))?;
        Ok(Json(json!({"message": "Bookmark removed from collection"})))
    })
}

#[derive(Debug, Deserialize)]
struct VisibilityRequest {
    is_public: bool,
}

async fn set_visibility(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(id): Path<String>,
    Json(payload): Json<VisibilityRequest>,
) -> Result<Json<Bookmark>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.set_visibility(
            &user.id,
            &Eid::from(id),
            payload.is_public,
        )?))
    })
}

async fn public_bookmarks(
    State(state): State<Arc<SharedState>>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PublicBookmarks>, HttpError> {
    let viewer = resolve_user(&state, &headers).await;
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(app.public_bookmarks(&handle, viewer.as_ref())?))
    })
}

#[derive(Debug, Default, Deserialize)]
struct EmailRequest {
    #[serde(default)]
    email: Option<String>,
}

async fn subscribe(
    State(state): State<Arc<SharedState>>,
    Path(handle): Path<String>,
    Json(payload): Json<EmailRequest>,
) -> Result<(StatusCode, Json<Value>), HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let email = payload.email.unwrap_or_default();
        app.subscribe(&handle, &email)?;
        Ok((
            StatusCode::CREATED,
            Json(json!({"message": "Subscribed successfully"})),
        ))
    })
}

async fn unsubscribe(
    State(state): State<Arc<SharedState>>,
    Path(handle): Path<String>,
    headers: HeaderMap,
    payload: Option<Json<EmailRequest>>,
) -> Result<Json<Value>, HttpError> {
    let viewer = resolve_user(&state, &headers).await;
    let email = payload
        .and_then(|Json(req)| req.email)
        .filter(|e| !e.trim().is_empty())
        .or_else(|| viewer.map(|v| v.email))
        .ok_or_else(|| AppError::validation("Email is required"))?;
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.unsubscribe(&handle, &email)?;
        Ok(Json(json!({"message": "Unsubscribed successfully"})))
    })
}

async fn subscriber_count(
    State(state): State<Arc<SharedState>>,
    Path(handle): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(json!({"count": app.subscriber_count(&handle)?})))
    })
}

async fn list_subscribers(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(handle): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let subscribers = app.subscribers(&handle, &user)?;
        Ok(Json(
            json!({"count": subscribers.len(), "subscribers": subscribers}),
        ))
    })
}

async fn subscription_check(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path(handle): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(Json(
            json!({"is_subscribed": app.is_subscribed(&handle, &user)?}),
        ))
    })
}

async fn remove_subscriber(
    State(state): State<Arc<SharedState>>,
    Extension(user): Extension<UserConfig>,
    Path((handle, email)): Path<(String, String)>,
) -> Result<Json<Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.remove_subscriber(&handle, &user, &email)?;
        Ok(Json(json!({"message": "Subscriber removed"})))
    })
}
