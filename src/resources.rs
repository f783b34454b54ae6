//! The studio's resources as queries and mutations.
//!
//! [`Resources`] builds a [`QueryDescriptor`] for each read and a [`Mutation`]
//! for each write, over a [`ResourceApi`]. Descriptors are cheap; build one per
//! tick and hand it to [`QueryObserver::update`](crate::query::QueryObserver::update).
//!
//! Cache keys, and the prefixes each write invalidates:
//!
//! | Read                              | Key                                       |
//! |-----------------------------------|-------------------------------------------|
//! | [`model`](Resources::model)       | `["model", id]`                           |
//! | [`my_models`](Resources::my_models) | `["models", "mine", token]`             |
//! | [`model_apis`](Resources::model_apis) | `["apis", model_id, page]`            |
//! | [`prototype`](Resources::prototype) | `["prototype", id]`                     |
//! | [`prototypes_of_model`](Resources::prototypes_of_model) | `["prototypes", model_id]` |
//! | [`feedbacks`](Resources::feedbacks) | `["feedbacks", prototype_id, page]`     |
//! | [`current_user`](Resources::current_user) | `["user", "self", token]`         |
//!
//! | Write                 | Invalidates                                                    |
//! |-----------------------|----------------------------------------------------------------|
//! | `create_prototype`    | `["prototypes", model_id]`                                     |
//! | `update_prototype`    | `["prototype", id]`, `["prototypes", model_id]`                |
//! | `delete_prototype`    | `["prototype", id]`, `["prototypes", model_id]`, `["feedbacks", id]` |
//! | `create_feedback`     | `["feedbacks", prototype_id]`                                  |
//! | `update_model`        | `["model", id]`, `["models"]`                                  |

mod api;
mod types;

use std::sync::Arc;

use futures::FutureExt as _;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub use api::{ApiRequest, HttpResourceApi, ResourceApi};
pub use types::{
    Feedback, Model, ModelPatch, NewFeedback, NewPrototype, Page, Prototype, PrototypePatch, User,
    VehicleApi, Visibility,
};

use crate::key::QueryKey;
use crate::query::{
    CacheValue, Mutation, QueryClient, QueryDescriptor, QueryError, Readiness, loader,
};
use crate::query_key;
use crate::session::SessionStore;

/// Page size for paginated lists.
pub const PAGE_LIMIT: u32 = 10;

/// Builds studio queries and mutations over one API and session.
#[derive(Clone)]
pub struct Resources {
    client: QueryClient,
    session: SessionStore,
    api: Arc<dyn ResourceApi>,
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Resources {
    pub fn new(client: QueryClient, session: SessionStore, api: Arc<dyn ResourceApi>) -> Self {
        Self {
            client,
            session,
            api,
        }
    }

    pub const fn client(&self) -> &QueryClient {
        &self.client
    }

    pub const fn session(&self) -> &SessionStore {
        &self.session
    }

    /// A read of `path` decoded as `V`.
    ///
    /// The token is read on every run of the loader, so refetches after a token
    /// refresh or logout send the current one.
    fn read<V>(&self, key: QueryKey, path: String, readiness: Readiness) -> QueryDescriptor<V>
    where
        V: CacheValue + DeserializeOwned,
    {
        let api = self.api.clone();
        let session = self.session.clone();
        QueryDescriptor::new(
            key,
            loader(move || {
                let request = ApiRequest::get(path.clone()).token(session.access_token());
                let response = api.request(request);
                async move { decode(response.await?) }
            }),
        )
        .readiness(readiness)
    }

    /// Token readiness for reads that need a signed-in user.
    fn signed_in(&self) -> (Option<String>, Readiness) {
        let token = self.session.access_token();
        let readiness = Readiness::require("access token", token.as_ref());
        (token, readiness)
    }

    pub fn model(&self, id: Option<&str>) -> QueryDescriptor<Model> {
        self.read(
            query_key!["model", id],
            format!("/model/{}", segment(id.unwrap_or_default())),
            Readiness::require("model id", id.as_ref()),
        )
    }

    /// Models the signed-in user owns or contributes to. Not ready while anonymous.
    pub fn my_models(&self) -> QueryDescriptor<Page<Model>> {
        let (token, readiness) = self.signed_in();
        self.read(
            query_key!["models", "mine"].secret(token),
            format!("/model?is_contributor=true&limit={PAGE_LIMIT}"),
            readiness,
        )
    }

    pub fn model_apis(&self, model_id: Option<&str>, page: u32) -> QueryDescriptor<Page<VehicleApi>> {
        self.read(
            query_key!["apis", model_id, page],
            format!(
                "/model/{}/api?page={page}&limit={PAGE_LIMIT}",
                segment(model_id.unwrap_or_default())
            ),
            Readiness::require("model id", model_id.as_ref()),
        )
    }

    pub fn prototype(&self, id: Option<&str>) -> QueryDescriptor<Prototype> {
        self.read(
            query_key!["prototype", id],
            format!("/prototype/{}", segment(id.unwrap_or_default())),
            Readiness::require("prototype id", id.as_ref()),
        )
    }

    pub fn prototypes_of_model(&self, model_id: Option<&str>) -> QueryDescriptor<Vec<Prototype>> {
        self.read(
            query_key!["prototypes", model_id],
            format!("/prototype?model_id={}", segment(model_id.unwrap_or_default())),
            Readiness::require("model id", model_id.as_ref()),
        )
    }

    pub fn feedbacks(&self, prototype_id: Option<&str>, page: u32) -> QueryDescriptor<Page<Feedback>> {
        self.read(
            query_key!["feedbacks", prototype_id, page],
            format!(
                "/feedback?prototype_id={}&page={page}&limit={PAGE_LIMIT}",
                segment(prototype_id.unwrap_or_default())
            ),
            Readiness::require("prototype id", prototype_id.as_ref()),
        )
    }

    /// The signed-in user's profile. Not ready while anonymous.
    pub fn current_user(&self) -> QueryDescriptor<User> {
        let (token, readiness) = self.signed_in();
        self.read(query_key!["user", "self"].secret(token), "/user/self".to_string(), readiness)
    }

    /// A write whose request is built from its input and whose response decodes as `O`.
    fn write<I, O, R, A>(&self, request: R, affected: A) -> Mutation<I, O>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + DeserializeOwned + 'static,
        R: Fn(&I) -> Result<ApiRequest, QueryError> + Send + Sync + 'static,
        A: Fn(&I, &O) -> Vec<QueryKey> + Send + Sync + 'static,
    {
        let api = self.api.clone();
        let session = self.session.clone();
        Mutation::new(
            self.client.clone(),
            move |input: I| {
                // Read the token at execution time; the session may have changed
                // since the mutation was built.
                let request = request(&input).map(|r| r.token(session.access_token()));
                let api = api.clone();
                async move {
                    let request = request?;
                    debug!(method = %request.method, path = %request.path, "mutation");
                    decode(api.request(request).await?)
                }
                .boxed()
            },
            affected,
        )
    }

    pub fn create_prototype(&self) -> Mutation<NewPrototype, Prototype> {
        self.write(
            |input: &NewPrototype| Ok(ApiRequest::post("/prototype", to_json(input)?)),
            |input, _| vec![query_key!["prototypes", input.model_id.as_str()]],
        )
    }

    pub fn update_prototype(&self) -> Mutation<PrototypePatch, Prototype> {
        self.write(
            |patch: &PrototypePatch| {
                Ok(ApiRequest::patch(
                    format!("/prototype/{}", segment(&patch.id)),
                    to_json(patch)?,
                ))
            },
            |patch, updated: &Prototype| {
                vec![
                    query_key!["prototype", patch.id.as_str()],
                    query_key!["prototypes", updated.model_id.as_str()],
                ]
            },
        )
    }

    /// Input is the prototype to delete; its model id scopes the invalidation.
    pub fn delete_prototype(&self) -> Mutation<Prototype, Value> {
        self.write(
            |prototype: &Prototype| Ok(ApiRequest::delete(format!("/prototype/{}", segment(&prototype.id)))),
            |prototype, _| {
                vec![
                    query_key!["prototype", prototype.id.as_str()],
                    query_key!["prototypes", prototype.model_id.as_str()],
                    query_key!["feedbacks", prototype.id.as_str()],
                ]
            },
        )
    }

    pub fn create_feedback(&self) -> Mutation<NewFeedback, Feedback> {
        self.write(
            |input: &NewFeedback| Ok(ApiRequest::post("/feedback", to_json(input)?)),
            |input, _| vec![query_key!["feedbacks", input.prototype_id.as_str()]],
        )
    }

    pub fn update_model(&self) -> Mutation<ModelPatch, Model> {
        self.write(
            |patch: &ModelPatch| {
                Ok(ApiRequest::patch(format!("/model/{}", segment(&patch.id)), to_json(patch)?))
            },
            |patch, _| vec![query_key!["model", patch.id.as_str()], query_key!["models"]],
        )
    }

    /// Ends the session locally, then notifies the server on a best-effort basis.
    pub async fn logout(&self) {
        let api = self.api.clone();
        self.session.logout(|token| api.logout(token)).await;
    }
}

fn decode<V: DeserializeOwned>(value: Value) -> Result<V, QueryError> {
    serde_json::from_value(value).map_err(|e| QueryError::Decode(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, QueryError> {
    serde_json::to_value(value).map_err(|e| QueryError::Decode(e.to_string()))
}

/// Percent-encodes one path segment or query value.
fn segment(raw: &str) -> String {
    // Form encoding writes spaces as `+`; a literal `+` is already `%2B`.
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
