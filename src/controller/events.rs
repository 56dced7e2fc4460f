//! Kubernetes Event emission
//!
//! Events are audit trail only. Failures to record one are logged and
//! swallowed so they can never fail a reconcile.

use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ObjectMeta, PostParams},
    Client, Resource, ResourceExt,
};
use tracing::warn;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Record an event against `obj`.
pub async fn publish<K>(client: &Client, obj: &K, event_type: &str, reason: &str, message: &str)
where
    K: Resource<DynamicType = ()>,
{
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-event-", obj.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: obj.object_ref(&()),
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        ..Default::default()
    };

    if let Err(e) = events.create(&PostParams::default(), &event).await {
        warn!(
            name = %obj.name_any(),
            reason,
            "Could not record event: {:?}", e
        );
    }
}
