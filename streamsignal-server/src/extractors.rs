use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{self, request},
};
use streamsignal_api::{AuthToken, Store, UserId, Uuid};

use crate::{Error, Feeds};

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub feeds: Feeds,
}

pub struct PreAuth(pub AuthToken);

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        match req.headers.get(http::header::AUTHORIZATION) {
            None => Err(Error::permission_denied()),
            Some(auth) => {
                let auth = auth.to_str().map_err(|_| Error::permission_denied())?;
                let mut auth = auth.split(' ');
                if !auth
                    .next()
                    .ok_or(Error::permission_denied())?
                    .eq_ignore_ascii_case("bearer")
                {
                    return Err(Error::permission_denied());
                }
                let token = auth.next().ok_or(Error::permission_denied())?;
                if auth.next().is_some() {
                    return Err(Error::permission_denied());
                }
                let token = Uuid::try_parse(token).map_err(|_| Error::permission_denied())?;
                Ok(PreAuth(AuthToken(token)))
            }
        }
    }
}

pub struct Auth(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        Ok(Auth(state.store.recover_session(token).await?))
    }
}

/// Like `Auth`, but anonymous requests are let through
///
/// A request that does carry credentials must carry valid ones.
pub struct MaybeAuth(pub Option<UserId>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState,
    ) -> Result<MaybeAuth, Error> {
        if !req.headers.contains_key(http::header::AUTHORIZATION) {
            return Ok(MaybeAuth(None));
        }
        let Auth(user) = Auth::from_request_parts(req, state).await?;
        Ok(MaybeAuth(Some(user)))
    }
}
