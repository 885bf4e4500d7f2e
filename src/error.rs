use std::fmt::Display;

use jsonwebtoken::errors::{Error as JwtError, ErrorKind as JwtErrorKind};
use log::{debug, error};
use rocket::{
    http::{Status, StatusClass},
    response::{status::Custom, Responder},
    serde::json::Json,
    Request,
};
use thiserror::Error;

use crate::coordinator::VoteError;
use crate::model::api::vote::Message;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error("{1}")]
    Status(Status, String),
}

impl Error {
    pub fn not_found(what: impl Display) -> Self {
        Self::Status(Status::NotFound, format!("{what} not found"))
    }

    pub fn bad_request(reason: impl Display) -> Self {
        Self::Status(Status::BadRequest, format!("Bad request: {reason}"))
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Store(_) => Status::InternalServerError,
            Self::Vote(e) => match e {
                VoteError::NotAuthorized(_) => Status::Forbidden,
                VoteError::ElectionNotActive(_) | VoteError::AlreadyVoted(_) => Status::Conflict,
                VoteError::CandidateNotFound { .. } => Status::NotFound,
                VoteError::TransientStoreFailure(_) => Status::ServiceUnavailable,
                VoteError::CommitOutcomeUnknown(_) | VoteError::Store(_) => {
                    Status::InternalServerError
                }
            },
            Self::Jwt(e) => match e.kind() {
                JwtErrorKind::ExpiredSignature
                | JwtErrorKind::ImmatureSignature
                | JwtErrorKind::InvalidSignature
                | JwtErrorKind::InvalidToken => Status::Unauthorized,
                _ => Status::InternalServerError,
            },
            Self::Status(status, _) => *status,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();
        // Server-side detail stays in the logs.
        let message = match status.class() {
            StatusClass::ServerError => {
                error!("{status}: {self}");
                match self {
                    Self::Vote(VoteError::TransientStoreFailure(_)) => {
                        "Vote could not be recorded, please try again".to_string()
                    }
                    Self::Vote(VoteError::CommitOutcomeUnknown(_)) => {
                        "Vote may have been recorded, check your voted status before retrying"
                            .to_string()
                    }
                    _ => status.reason_lossy().to_string(),
                }
            }
            _ => {
                debug!("{status}: {self}");
                self.to_string()
            }
        };
        Custom(status, Json(Message::new(message))).respond_to(req)
    }
}
