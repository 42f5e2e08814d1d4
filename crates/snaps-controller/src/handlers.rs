//! Handler permissions, origin checks, result shapes, and error triage.

use std::time::Duration;

use serde_json::Value;
use snaps_execution::{ExecutionError, HandlerType, JsonRpcError, SnapId};

use crate::error::SnapControllerError;
use crate::permissions::{Permission, PermissionController};

/// Permission backing `onRpcRequest`.
pub const RPC_PERMISSION: &str = "endowment:rpc";
/// Permission backing `onTransaction`.
pub const TRANSACTION_INSIGHT_PERMISSION: &str = "endowment:transaction-insight";
/// Permission backing `onSignature`.
pub const SIGNATURE_INSIGHT_PERMISSION: &str = "endowment:signature-insight";
/// Permission backing `onCronjob`.
pub const CRONJOB_PERMISSION: &str = "endowment:cronjob";
/// Permission backing `onNameLookup`.
pub const NAME_LOOKUP_PERMISSION: &str = "endowment:name-lookup";
/// Permission backing `onHomePage`.
pub const HOME_PAGE_PERMISSION: &str = "endowment:page-home";
/// Permission backing `onKeyringRequest`.
pub const KEYRING_PERMISSION: &str = "endowment:keyring";
/// Permission backing `onInstall` and `onUpdate`.
pub const LIFECYCLE_HOOKS_PERMISSION: &str = "endowment:lifecycle-hooks";

/// Caveat overriding the request budget, in milliseconds.
pub const MAX_REQUEST_TIME_CAVEAT: &str = "maxRequestTime";
/// Caveat restricting who may call `onRpcRequest`.
pub const RPC_ORIGIN_CAVEAT: &str = "rpcOrigin";
/// Caveat restricting who may call `onKeyringRequest`.
pub const KEYRING_ORIGIN_CAVEAT: &str = "keyringOrigin";

const ENDOWMENT_PREFIX: &str = "endowment:";

/// Globals every snap receives.
pub const DEFAULT_ENDOWMENTS: &[&str] = &[
    "atob",
    "btoa",
    "BigInt",
    "console",
    "crypto",
    "Date",
    "Math",
    "setTimeout",
    "clearTimeout",
    "setInterval",
    "clearInterval",
    "SubtleCrypto",
    "TextDecoder",
    "TextEncoder",
    "URL",
    "Uint8Array",
];

/// Permission a snap must hold to export `handler`.
#[must_use]
pub const fn handler_permission(handler: HandlerType) -> &'static str {
    match handler {
        HandlerType::OnRpcRequest => RPC_PERMISSION,
        HandlerType::OnTransaction => TRANSACTION_INSIGHT_PERMISSION,
        HandlerType::OnSignature => SIGNATURE_INSIGHT_PERMISSION,
        HandlerType::OnCronjob => CRONJOB_PERMISSION,
        HandlerType::OnNameLookup => NAME_LOOKUP_PERMISSION,
        HandlerType::OnHomePage => HOME_PAGE_PERMISSION,
        HandlerType::OnKeyringRequest => KEYRING_PERMISSION,
        HandlerType::OnInstall | HandlerType::OnUpdate => LIFECYCLE_HOOKS_PERMISSION,
    }
}

/// Globals granted by endowment permissions, by permission name.
fn permission_endowments(name: &str) -> &'static [&'static str] {
    match name {
        "endowment:network-access" => &["fetch", "Request", "Headers", "Response"],
        "endowment:webassembly" => &["WebAssembly"],
        _ => &[],
    }
}

/// Globals a snap holding `permissions` receives, defaults first.
#[must_use]
pub fn endowments<'a>(permissions: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut endowments: Vec<String> = DEFAULT_ENDOWMENTS.iter().map(|name| (*name).to_owned()).collect();
    for name in permissions {
        if !name.starts_with(ENDOWMENT_PREFIX) {
            continue;
        }
        for global in permission_endowments(name) {
            if !endowments.iter().any(|existing| existing == global) {
                endowments.push((*global).to_owned());
            }
        }
    }
    endowments
}

/// Request budget from the `maxRequestTime` caveat, or `default`.
#[must_use]
pub fn request_timeout(permission: &Permission, default: Duration) -> Duration {
    permission
        .caveat(MAX_REQUEST_TIME_CAVEAT)
        .and_then(Value::as_u64)
        .map_or(default, Duration::from_millis)
}

fn is_snap_origin(origin: &str) -> bool {
    SnapId::from(origin).is_valid()
}

fn listed(caveat: &Value, origin: &str) -> bool {
    caveat
        .get("allowedOrigins")
        .and_then(Value::as_array)
        .is_some_and(|origins| origins.iter().any(|allowed| allowed.as_str() == Some(origin)))
}

fn origin_allowed(handler: HandlerType, permission: &Permission, origin: &str) -> bool {
    match handler {
        HandlerType::OnRpcRequest => permission.caveat(RPC_ORIGIN_CAVEAT).is_some_and(|caveat| {
            let flag = |key: &str| caveat.get(key).and_then(Value::as_bool).unwrap_or(false);
            let by_kind = if is_snap_origin(origin) {
                flag("snaps")
            } else {
                flag("dapps")
            };
            by_kind || listed(caveat, origin)
        }),
        HandlerType::OnKeyringRequest => permission
            .caveat(KEYRING_ORIGIN_CAVEAT)
            .is_some_and(|caveat| listed(caveat, origin)),
        _ => true,
    }
}

/// Checks that `snap_id` may serve `handler` to `origin` and returns the
/// request budget.
///
/// # Errors
///
/// Returns [`SnapControllerError::HandlerNotPermitted`] when the backing
/// permission is missing and [`SnapControllerError::OriginNotAllowed`] when
/// the origin caveat rejects the caller.
pub fn authorize_request(
    permissions: &dyn PermissionController,
    snap_id: &SnapId,
    origin: &str,
    handler: HandlerType,
    default_timeout: Duration,
) -> Result<Duration, SnapControllerError> {
    let permission = permissions
        .permission(snap_id, handler_permission(handler))
        .ok_or_else(|| SnapControllerError::HandlerNotPermitted {
            snap_id: snap_id.clone(),
            handler,
        })?;
    if !origin_allowed(handler, &permission, origin) {
        return Err(SnapControllerError::OriginNotAllowed {
            snap_id: snap_id.clone(),
            origin: origin.to_owned(),
            handler,
        });
    }
    Ok(request_timeout(&permission, default_timeout))
}

fn has_any_key(value: &Value, keys: &[&str]) -> bool {
    value
        .as_object()
        .is_some_and(|object| keys.iter().any(|key| object.contains_key(*key)))
}

/// Rejects results whose shape the handler does not allow.
///
/// # Errors
///
/// Returns [`SnapControllerError::InvalidResult`] describing the mismatch.
pub fn assert_result_shape(
    snap_id: &SnapId,
    handler: HandlerType,
    result: &Value,
) -> Result<(), SnapControllerError> {
    let problem = match handler {
        HandlerType::OnTransaction | HandlerType::OnSignature
            if !result.is_null() && !has_any_key(result, &["content", "id"]) =>
        {
            Some("expected null or an object with `content` or `id`")
        }
        HandlerType::OnNameLookup
            if !result.is_null()
                && !has_any_key(result, &["resolvedAddresses", "resolvedDomains"]) =>
        {
            Some("expected null or an object with `resolvedAddresses` or `resolvedDomains`")
        }
        HandlerType::OnHomePage if !has_any_key(result, &["content", "id"]) => {
            Some("expected an object with `content` or `id`")
        }
        _ => None,
    };
    problem.map_or(Ok(()), |message| {
        Err(SnapControllerError::InvalidResult {
            snap_id: snap_id.clone(),
            handler,
            message: message.to_owned(),
        })
    })
}

/// Outcome of triaging an execution failure.
#[derive(Debug, Clone, PartialEq)]
pub struct TriagedError {
    /// Error to return to the caller.
    pub error: SnapControllerError,
    /// Whether the snap handled the error itself. Unhandled errors crash the
    /// snap.
    pub handled: bool,
}

/// Separates errors a snap reported on purpose from failures of the snap.
///
/// A wrapped snap error whose cause is a JSON-RPC error is handled; the cause
/// is returned. Every other failure is unhandled.
#[must_use]
pub fn triage_error(error: ExecutionError) -> TriagedError {
    let ExecutionError::Rpc(rpc) = error else {
        return TriagedError {
            error: SnapControllerError::Execution(error),
            handled: false,
        };
    };
    match rpc.wrapped_cause() {
        Some(cause) => match JsonRpcError::from_value(cause) {
            Some(inner) => TriagedError {
                error: SnapControllerError::Snap(inner),
                handled: true,
            },
            None => {
                let message = cause
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unhandled snap error");
                TriagedError {
                    error: SnapControllerError::Snap(
                        JsonRpcError::internal(message).with_data(serde_json::json!({ "cause": cause })),
                    ),
                    handled: false,
                }
            }
        },
        None => TriagedError {
            error: SnapControllerError::Snap(rpc),
            handled: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;
    use snaps_execution::jsonrpc::INTERNAL_ERROR;

    use super::*;
    use crate::permissions::Caveat;
    use crate::test_support::InMemoryPermissions;

    const SNAP: &str = "npm:handlers";
    const DAPP: &str = "https://dapp.example";

    fn rpc_permission(caveat: Value) -> Permission {
        Permission::with_caveats(vec![Caveat::new(RPC_ORIGIN_CAVEAT, caveat)])
    }

    fn grant(permissions: &InMemoryPermissions, name: &str, permission: Permission) {
        permissions.grant(
            &SnapId::from(SNAP),
            &[(name.to_owned(), permission)].into_iter().collect(),
        );
    }

    #[rstest]
    #[case(json!({"dapps": true}), DAPP, true)]
    #[case(json!({"dapps": false, "snaps": true}), DAPP, false)]
    #[case(json!({"snaps": true}), "npm:caller", true)]
    #[case(json!({"allowedOrigins": [DAPP]}), DAPP, true)]
    #[case(json!({"allowedOrigins": ["https://other.example"]}), DAPP, false)]
    fn rpc_origin_caveat_gates_callers(
        #[case] caveat: Value,
        #[case] origin: &str,
        #[case] allowed: bool,
    ) {
        let permissions = InMemoryPermissions::default();
        grant(&permissions, RPC_PERMISSION, rpc_permission(caveat));

        let result = authorize_request(
            &permissions,
            &SnapId::from(SNAP),
            origin,
            HandlerType::OnRpcRequest,
            Duration::from_secs(60),
        );

        assert_eq!(result.is_ok(), allowed);
    }

    #[rstest]
    fn missing_permission_is_rejected() {
        let permissions = InMemoryPermissions::default();
        let error = authorize_request(
            &permissions,
            &SnapId::from(SNAP),
            DAPP,
            HandlerType::OnCronjob,
            Duration::from_secs(60),
        )
        .expect_err("no cronjob permission");
        assert!(matches!(error, SnapControllerError::HandlerNotPermitted { .. }));
    }

    #[rstest]
    fn max_request_time_caveat_overrides_default() {
        let permissions = InMemoryPermissions::default();
        grant(
            &permissions,
            CRONJOB_PERMISSION,
            Permission::with_caveats(vec![Caveat::new(MAX_REQUEST_TIME_CAVEAT, json!(5_000))]),
        );

        let timeout = authorize_request(
            &permissions,
            &SnapId::from(SNAP),
            DAPP,
            HandlerType::OnCronjob,
            Duration::from_secs(60),
        )
        .expect("authorized");

        assert_eq!(timeout, Duration::from_secs(5));
    }

    #[rstest]
    #[case(HandlerType::OnTransaction, json!(null), true)]
    #[case(HandlerType::OnTransaction, json!({"content": {}}), true)]
    #[case(HandlerType::OnTransaction, json!({"foo": 1}), false)]
    #[case(HandlerType::OnHomePage, json!(null), false)]
    #[case(HandlerType::OnHomePage, json!({"id": "ui"}), true)]
    #[case(HandlerType::OnNameLookup, json!({"resolvedDomains": []}), true)]
    #[case(HandlerType::OnRpcRequest, json!(42), true)]
    fn checks_result_shapes(#[case] handler: HandlerType, #[case] result: Value, #[case] ok: bool) {
        assert_eq!(
            assert_result_shape(&SnapId::from(SNAP), handler, &result).is_ok(),
            ok
        );
    }

    #[rstest]
    fn json_rpc_causes_are_handled() {
        let error = ExecutionError::Rpc(JsonRpcError::wrap_snap_error(
            json!({"code": -32000, "message": "nope"}),
        ));

        let triaged = triage_error(error);

        assert!(triaged.handled);
        assert_eq!(
            triaged.error,
            SnapControllerError::Snap(JsonRpcError::new(-32000, "nope"))
        );
    }

    #[rstest]
    fn thrown_values_are_unhandled() {
        let error = ExecutionError::Rpc(JsonRpcError::wrap_snap_error(json!({"message": "boom"})));

        let triaged = triage_error(error);

        assert!(!triaged.handled);
        let SnapControllerError::Snap(rpc) = triaged.error else {
            panic!("expected a snap error");
        };
        assert_eq!(rpc.code, INTERNAL_ERROR);
        assert_eq!(rpc.message, "boom");
    }

    #[rstest]
    fn transport_failures_are_unhandled() {
        let triaged = triage_error(ExecutionError::Disconnected);
        assert!(!triaged.handled);
        assert_eq!(
            triaged.error,
            SnapControllerError::Execution(ExecutionError::Disconnected)
        );
    }

    #[rstest]
    fn endowment_permissions_extend_the_defaults() {
        let names = ["endowment:network-access".to_owned(), "snap_dialog".to_owned()];
        let endowments = endowments(&names);
        assert!(endowments.iter().any(|name| name == "fetch"));
        assert!(endowments.iter().any(|name| name == "console"));
        assert_eq!(
            endowments.len(),
            DEFAULT_ENDOWMENTS.len() + 4,
            "only endowment permissions contribute globals"
        );
    }
}
