//! Mutating admission webhook for Pods
//!
//! Decodes `AdmissionReview` requests, hands the Pod to [`PodMutator`] and
//! wraps the decision in an `AdmissionResponse`. Every path through the
//! handler allows the pod; failures only cost the rewrite.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, error};

use crate::mutate::{AdmissionDecision, PodMutator};

/// Path the MutatingWebhookConfiguration points at
pub const MUTATE_POD_PATH: &str = "/mutate-v1-pod";

/// Shared state for webhook handlers
#[derive(Clone, Debug)]
pub struct WebhookState {
    /// Pod mutator backed by the registry-mapping cache
    pub mutator: PodMutator,
}

impl WebhookState {
    /// Create webhook state around a mutator
    pub fn new(mutator: PodMutator) -> Self {
        Self { mutator }
    }
}

/// Create the webhook router
///
/// - POST /mutate-v1-pod - rewrite pod images onto Harbor
/// - GET /healthz - liveness
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_POD_PATH, post(mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Handle a mutating admission review for a Pod
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(mutate_pod(&state.mutator, &req).into_review())
}

/// Build the admission response for one request
pub fn mutate_pod(mutator: &PodMutator, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let uid = request.uid.clone();
    let response = AdmissionResponse::from(request);

    let Some(pod) = &request.object else {
        debug!(uid = %uid, "No pod object in request, allowing unchanged");
        return response;
    };

    match mutator.handle(pod) {
        AdmissionDecision::Allow => response,
        AdmissionDecision::Patch(patch) => {
            let operations = patch.0.len();
            match response.clone().with_patch(patch) {
                Ok(patched) => {
                    debug!(uid = %uid, operations = operations, "Returning image patch");
                    patched
                }
                Err(e) => {
                    error!(uid = %uid, error = %e, "Failed to serialize patch, allowing pod unmodified");
                    response
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::ProjectsCache;
    use crate::harbor::{MockProjectSource, UpstreamProject};
    use crate::policy::RegistryPolicy;
    use crate::rewrite::ImageRewriter;

    fn review(images: &[&str]) -> serde_json::Value {
        let containers: Vec<_> = images
            .iter()
            .enumerate()
            .map(|(i, image)| serde_json::json!({"name": format!("c{i}"), "image": image}))
            .collect();
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "requestKind": {"group": "", "version": "v1", "kind": "Pod"},
                "requestResource": {"group": "", "version": "v1", "resource": "pods"},
                "namespace": "shop",
                "operation": "CREATE",
                "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"generateName": "web-", "namespace": "shop"},
                    "spec": {"containers": containers}
                },
                "dryRun": false
            }
        })
    }

    async fn state(warm: bool) -> Arc<WebhookState> {
        let mut source = MockProjectSource::new();
        source.expect_list_proxy_projects().returning(|| {
            Ok(vec![UpstreamProject {
                project_id: 1,
                project_name: "proxy/dockerhub".to_string(),
                registry_url: "https://hub.docker.com".to_string(),
            }])
        });
        let cache = Arc::new(ProjectsCache::new(
            Arc::new(source),
            RegistryPolicy::docker_hub(),
            Duration::from_secs(60),
        ));
        if warm {
            cache.refresh().await.unwrap();
        }
        let rewriter = ImageRewriter::new("harbor.example.com", RegistryPolicy::docker_hub());
        Arc::new(WebhookState::new(PodMutator::new(cache, rewriter)))
    }

    async fn post_review(state: Arc<WebhookState>, body: serde_json::Value) -> serde_json::Value {
        let response = webhook_router(state)
            .oneshot(
                Request::post(MUTATE_POD_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn decoded_patch(review: &serde_json::Value) -> Option<serde_json::Value> {
        use base64::Engine as _;
        let bytes: Vec<u8> = match &review["response"]["patch"] {
            serde_json::Value::String(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap(),
            serde_json::Value::Array(raw) => raw.iter().map(|b| b.as_u64().unwrap() as u8).collect(),
            _ => return None,
        };
        Some(serde_json::from_slice(&bytes).unwrap())
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: a Docker Hub image is patched to pull through Harbor
    #[tokio::test]
    async fn story_hub_pod_receives_json_patch() {
        let out = post_review(state(true).await, review(&["busybox:1.2"])).await;

        assert_eq!(out["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(out["response"]["allowed"], true);
        assert_eq!(out["response"]["patchType"], "JSONPatch");
        assert_eq!(
            decoded_patch(&out).unwrap(),
            serde_json::json!([{
                "op": "replace",
                "path": "/spec/containers/0/image",
                "value": "harbor.example.com/proxy/dockerhub/library/busybox:1.2"
            }])
        );
    }

    /// Story: unmapped images are allowed without a patch
    #[tokio::test]
    async fn story_unmapped_pod_allowed_without_patch() {
        let out = post_review(state(true).await, review(&["quay.io/org/app:1"])).await;
        assert_eq!(out["response"]["allowed"], true);
        assert!(decoded_patch(&out).is_none());
    }

    /// Story: a cold cache allows the pod as submitted
    #[tokio::test]
    async fn story_cold_cache_allows_without_patch() {
        let out = post_review(state(false).await, review(&["busybox:1.2"])).await;
        assert_eq!(out["response"]["allowed"], true);
        assert!(decoded_patch(&out).is_none());
    }

    /// Story: a review without a request is answered, not rejected at HTTP level
    #[tokio::test]
    async fn story_review_without_request_is_invalid() {
        let body = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        });
        let out = post_review(state(true).await, body).await;
        assert_eq!(out["response"]["allowed"], false);
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let response = webhook_router(state(false).await)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
