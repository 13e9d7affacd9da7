use std::borrow::Cow;

use http::StatusCode;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object to be used
/// across the codebase to tag errors with information that is used to
/// classify.
///
/// The msg is conveyed as a user facing error message if it makes it to the
/// client.
///
/// The short_msg is used as a tag - available for tests and for callers that
/// need to branch on a specific failure - to have a message that is resilient
/// to changes in copy. The HTTP layer sends the short_msg as a separate field
/// in error response bodies.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching
    /// w/ a standard test helper.
    /// Eg InvalidSortKey
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    /// Eg "Sort key 'frobnitz' is not a sortable image attribute"
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    ClientDisconnect,

    Overloaded,

    OperationalInternalServerError,
}

/// Stable short_msg tags for failures callers need to branch on. Kept as
/// constants so the branch points and the constructors cannot drift apart.
pub const FORBIDDEN_PUBLIC_IMAGE: &str = "ForbiddenPublicImage";
pub const PROTECTED_IMAGE_DELETE: &str = "ProtectedImageDelete";
pub const STORE_DELETE_NOT_SUPPORTED: &str = "StoreDeleteNotSupported";
pub const STORE_WRITE_NOT_SUPPORTED: &str = "StoreWriteNotSupported";

pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";

impl ErrorMetadata {
    /// Bad Request. Maps to 400 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error.
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found. Maps to 404 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// ImageNotFound). The msg should be a descriptive message targeted
    /// toward the developer. This is also the error raised when the resource
    /// exists but the caller may not see it, so absence and invisibility are
    /// indistinguishable on the wire.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// MissingIdentity). The msg should be a descriptive message targeted
    /// toward the developer.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Forbidden. Maps to 403 in HTTP.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// ImageNotMutable). The msg should be a descriptive message targeted
    /// toward the developer.
    pub fn forbidden(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Conflict with existing state. Maps to 409 in HTTP. Raised on id
    /// collision at image create and on concurrent uploads for one image.
    pub fn conflict(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Conflict,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Client went away mid-request. Downloads and uploads interrupted by a
    /// disconnect are classified here rather than as server faults.
    pub fn client_disconnect() -> Self {
        Self {
            code: ErrorCode::ClientDisconnect,
            short_msg: "ClientDisconnected".into(),
            msg: "The client disconnected before the transfer completed".into(),
        }
    }

    /// Transport failure talking to a downstream store.
    pub fn client_connection_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::ClientDisconnect,
            short_msg: "ClientConnectionError".into(),
            msg: msg.into(),
        }
    }

    /// Transient resource exhaustion, e.g. the catalog retry budget ran out
    /// against a wedged database. Maps to 503 in HTTP.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Operational Internal Server Error (maps to 500 in HTTP)
    ///
    /// Produces a very general error message for the user. Should be
    /// used in situations where the error is caused by a known operational
    /// source of downtime (eg during a restart or code push)
    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: INTERNAL_SERVER_ERROR_MSG.into(),
        }
    }

    /// A mutation was denied on an image the caller can see but does not own,
    /// and the image is public. Distinguishable from the private case, which
    /// surfaces as `not_found`.
    pub fn forbidden_public_image() -> Self {
        Self::forbidden(FORBIDDEN_PUBLIC_IMAGE, "You do not own this public image")
    }

    /// Delete attempted on an image with the protected flag set.
    pub fn protected_image_delete(image_id: &str) -> Self {
        Self::forbidden(
            PROTECTED_IMAGE_DELETE,
            format!("Image {image_id} is protected and cannot be deleted"),
        )
    }

    /// The backend holding a body has no delete operation. Callers scheduling
    /// delayed deletes swallow this; synchronous deletes propagate it.
    pub fn store_delete_not_supported(scheme: &str) -> Self {
        Self::bad_request(
            STORE_DELETE_NOT_SUPPORTED,
            format!("The '{scheme}' store is read-only and cannot delete image bodies"),
        )
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.code == ErrorCode::Unauthenticated
    }

    pub fn is_forbidden(&self) -> bool {
        self.code == ErrorCode::Forbidden
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::Conflict
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    pub fn is_client_disconnect(&self) -> bool {
        self.code == ErrorCode::ClientDisconnect
    }

    pub fn is_forbidden_public_image(&self) -> bool {
        self.code == ErrorCode::Forbidden && self.short_msg == FORBIDDEN_PUBLIC_IMAGE
    }

    pub fn is_protected_image_delete(&self) -> bool {
        self.code == ErrorCode::Forbidden && self.short_msg == PROTECTED_IMAGE_DELETE
    }

    pub fn is_store_delete_unsupported(&self) -> bool {
        self.short_msg == STORE_DELETE_NOT_SUPPORTED
    }

    /// Return true if this error is deterministically caused by the caller.
    /// Retrying without changing the request cannot succeed.
    pub fn is_deterministic_user_error(&self) -> bool {
        match self.code {
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::Unauthenticated
            | ErrorCode::Conflict
            | ErrorCode::Forbidden => true,
            ErrorCode::OperationalInternalServerError
            | ErrorCode::ClientDisconnect
            | ErrorCode::Overloaded => false,
        }
    }
}

impl ErrorCode {
    fn http_status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            // HTTP has the unfortunate naming of 401 as unauthorized when it's
            // really about authentication.
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::OperationalInternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ClientDisconnect => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_bad_request(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_unauthenticated(&self) -> bool;
    fn is_forbidden(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn is_client_disconnect(&self) -> bool;
    fn is_forbidden_public_image(&self) -> bool;
    fn is_protected_image_delete(&self) -> bool;
    fn is_store_delete_unsupported(&self) -> bool;
    fn is_deterministic_user_error(&self) -> bool;
    fn user_facing_message(&self) -> String;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn http_status(&self) -> StatusCode;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as BadRequest
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    /// Returns true if error is tagged as NotFound
    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    /// Returns true if error is tagged as Unauthenticated
    fn is_unauthenticated(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_unauthenticated();
        }
        false
    }

    /// Returns true if error is tagged as Forbidden
    fn is_forbidden(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_forbidden();
        }
        false
    }

    /// Returns true if error is tagged as Conflict
    fn is_conflict(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_conflict();
        }
        false
    }

    /// Returns true if error is tagged as Overloaded
    fn is_overloaded(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_overloaded();
        }
        false
    }

    /// Returns true if error is tagged as ClientDisconnect
    fn is_client_disconnect(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_client_disconnect();
        }
        false
    }

    fn is_forbidden_public_image(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_forbidden_public_image();
        }
        false
    }

    fn is_protected_image_delete(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_protected_image_delete();
        }
        false
    }

    fn is_store_delete_unsupported(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_store_delete_unsupported();
        }
        false
    }

    /// Return true if this error is deterministically caused by the caller.
    fn is_deterministic_user_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_deterministic_user_error();
        }
        false
    }

    fn user_facing_message(&self) -> String {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.to_string();
        }
        INTERNAL_SERVER_ERROR_MSG.to_string()
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_SERVER_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_SERVER_ERROR_MSG
    }

    /// Return the HttpStatus code to use on response
    fn http_status(&self) -> StatusCode {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.code.http_status_code();
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self {
        match self.downcast::<ErrorMetadata>() {
            Ok(e) => f(e).into(),
            Err(e) => e,
        }
    }
}

/// Log an error at the level its classification deserves. Deterministic user
/// errors are the caller's fault and only worth info; everything else is a
/// server fault.
pub fn report_error(err: &mut anyhow::Error) {
    if err.is_deterministic_user_error() {
        tracing::info!("{err:#}");
    } else {
        tracing::error!("{err:#}");
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    #[test]
    fn test_http_status_mapping() -> anyhow::Result<()> {
        let err: anyhow::Error = ErrorMetadata::not_found("ImageNotFound", "no such image").into();
        assert_eq!(err.http_status(), StatusCode::NOT_FOUND);
        assert!(err.is_not_found());

        let err: anyhow::Error = ErrorMetadata::conflict("ImageIdExists", "duplicate").into();
        assert_eq!(err.http_status(), StatusCode::CONFLICT);

        let err = anyhow::anyhow!("plain untagged failure");
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        Ok(())
    }

    #[test]
    fn test_subkind_tags_survive_context() -> anyhow::Result<()> {
        let err: anyhow::Error = ErrorMetadata::protected_image_delete("abc123").into();
        let err = err.context("while deleting");
        assert!(err.is_protected_image_delete());
        assert!(err.is_forbidden());
        assert!(!err.is_forbidden_public_image());
        Ok(())
    }
}
