use crate::{ClientAuthenticator, RequestParts, ResponseParts};
use bytesstr::BytesStr;
use sip_types::header::HeaderError;
use sip_types::header::typed::{
    Algorithm, AuthChallenge, AuthResponse, DigestChallenge, DigestResponse, QopOption,
    QopResponse,
};
use sip_types::msg::RequestLine;
use sip_types::print::UriContext;
use sip_types::{Headers, Name};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("response contains no digest challenge")]
    NoChallenge,
    #[error("failed to authenticate realms: {0:?}")]
    FailedToAuthenticate(Vec<BytesStr>),
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(BytesStr),
    #[error("missing credentials for realm {0}")]
    MissingCredentials(BytesStr),
    #[error("unsupported qop")]
    UnsupportedQop,
    #[error(transparent)]
    Header(HeaderError),
}

/// Credentials mapped to their realm
///
/// The default credentials are used for every realm without an explicit entry.
#[derive(Debug, Default, Clone)]
pub struct DigestCredentials {
    default: Option<DigestUser>,
    map: HashMap<String, DigestUser>,
}

impl DigestCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(&mut self, credentials: DigestUser) {
        self.default = Some(credentials)
    }

    pub fn add_for_realm<R>(&mut self, realm: R, credentials: DigestUser)
    where
        R: Into<String>,
    {
        self.map.insert(realm.into(), credentials);
    }

    pub fn get_for_realm(&self, realm: &str) -> Option<&DigestUser> {
        self.map.get(realm).or(self.default.as_ref())
    }

    pub fn remove_for_realm(&mut self, realm: &str) {
        self.map.remove(realm);
    }
}

#[derive(Clone)]
pub struct DigestUser {
    user: String,
    password: Vec<u8>,
}

impl DigestUser {
    pub fn new<U, P>(user: U, password: P) -> Self
    where
        U: Into<String>,
        P: Into<Vec<u8>>,
    {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for DigestUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestUser")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Solves MD5 digest challenges of `401`/`407` responses
///
/// Every realm is answered once per nonce. A realm that rejects the answer again is only
/// retried a single time, and only when the new challenge is marked `stale`.
#[derive(Debug)]
pub struct DigestAuthenticator {
    pub credentials: DigestCredentials,
    responses: Vec<ResponseEntry>,
}

#[derive(Debug)]
struct ResponseEntry {
    header: DigestResponse,
    ha1: String,
    is_proxy: bool,
    /// Number of requests this response has been added to
    use_count: u32,
    /// Already retried after a stale nonce
    stale_retry: bool,
}

fn hash(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

impl ClientAuthenticator for DigestAuthenticator {
    type Error = DigestError;

    fn authorize_request(&mut self, line: &RequestLine, headers: &mut Headers) {
        let uri = line.uri.in_context(UriContext::ReqUri).to_string();

        for entry in &mut self.responses {
            let header = &mut entry.header;

            header.uri = uri.as_str().into();

            if let Some(qop_response) = &mut header.qop_response {
                qop_response.nc = entry.use_count + 1;
            }

            let ha2 = hash(&format!("{}:{}", line.method, uri));

            header.response = response(&entry.ha1, &header.nonce, header.qop_response.as_ref(), &ha2)
                .into();

            entry.use_count += 1;

            let name = if entry.is_proxy {
                Name::PROXY_AUTHORIZATION
            } else {
                Name::AUTHORIZATION
            };

            headers.insert_type(name, &AuthResponse::Digest(header.clone()));
        }
    }

    fn handle_rejection(
        &mut self,
        rejected_request: RequestParts<'_>,
        reject_response: ResponseParts<'_>,
    ) -> Result<(), DigestError> {
        let mut challenges = vec![];

        read_challenges(false, reject_response.headers, &mut challenges)?;
        read_challenges(true, reject_response.headers, &mut challenges)?;

        if challenges.is_empty() {
            return Err(DigestError::NoChallenge);
        }

        let mut failed_realms = vec![];

        for (is_proxy, challenge) in challenges {
            let previous = self
                .responses
                .iter()
                .position(|entry| entry.header.realm == challenge.realm);

            let stale_retry = match previous {
                None => false,
                Some(i) if challenge.stale && !self.responses[i].stale_retry => {
                    self.responses.remove(i);
                    true
                }
                Some(_) => {
                    log::debug!("credentials for realm {} were rejected", challenge.realm);
                    failed_realms.push(challenge.realm);
                    continue;
                }
            };

            let realm = challenge.realm.clone();

            match self.respond(rejected_request.line, challenge) {
                Ok((header, ha1)) => self.responses.push(ResponseEntry {
                    header,
                    ha1,
                    is_proxy,
                    use_count: 0,
                    stale_retry,
                }),
                Err(e) => {
                    log::warn!("failed to answer challenge for realm {realm}, {e}");
                    failed_realms.push(realm);
                }
            }
        }

        if failed_realms.is_empty() {
            Ok(())
        } else {
            Err(DigestError::FailedToAuthenticate(failed_realms))
        }
    }
}

impl DigestAuthenticator {
    pub fn new(credentials: DigestCredentials) -> Self {
        Self {
            credentials,
            responses: vec![],
        }
    }

    fn respond(
        &self,
        line: &RequestLine,
        challenge: DigestChallenge,
    ) -> Result<(DigestResponse, String), DigestError> {
        let is_session = match &challenge.algorithm {
            Algorithm::MD5 => false,
            Algorithm::MD5Sess => true,
            Algorithm::Other(other) => {
                return Err(DigestError::UnsupportedAlgorithm(other.clone()));
            }
        };

        let qop = if challenge.qop.is_empty() {
            None
        } else if challenge.qop.contains(&QopOption::Auth) {
            Some(QopOption::Auth)
        } else {
            return Err(DigestError::UnsupportedQop);
        };

        let user = self
            .credentials
            .get_for_realm(&challenge.realm)
            .ok_or_else(|| DigestError::MissingCredentials(challenge.realm.clone()))?;

        let cnonce = BytesStr::from(uuid::Uuid::new_v4().simple().to_string());

        let mut ha1 = format!(
            "{:x}",
            md5::compute(
                [
                    format!("{}:{}:", user.user, challenge.realm).as_bytes(),
                    &user.password,
                ]
                .concat()
            )
        );

        if is_session {
            ha1 = hash(&format!("{ha1}:{}:{cnonce}", challenge.nonce));
        }

        let uri = line.uri.in_context(UriContext::ReqUri).to_string();
        let ha2 = hash(&format!("{}:{uri}", line.method));

        let qop_response = qop.map(|qop| QopResponse { qop, cnonce, nc: 1 });

        let response = response(&ha1, &challenge.nonce, qop_response.as_ref(), &ha2);

        let header = DigestResponse {
            username: user.user.as_str().into(),
            realm: challenge.realm,
            nonce: challenge.nonce,
            uri: uri.into(),
            response: response.into(),
            algorithm: challenge.algorithm,
            opaque: challenge.opaque,
            qop_response,
            other: vec![],
        };

        Ok((header, ha1))
    }
}

fn response(ha1: &str, nonce: &str, qop: Option<&QopResponse>, ha2: &str) -> String {
    match qop {
        Some(QopResponse { qop, cnonce, nc }) => {
            hash(&format!("{ha1}:{nonce}:{nc:08x}:{cnonce}:{qop}:{ha2}"))
        }
        None => hash(&format!("{ha1}:{nonce}:{ha2}")),
    }
}

/// Collect the first digest challenge of every realm
fn read_challenges(
    is_proxy: bool,
    headers: &Headers,
    dst: &mut Vec<(bool, DigestChallenge)>,
) -> Result<(), DigestError> {
    let name = if is_proxy {
        Name::PROXY_AUTHENTICATE
    } else {
        Name::WWW_AUTHENTICATE
    };

    let challenges = headers
        .try_get::<Vec<AuthChallenge>>(name)
        .transpose()
        .map_err(DigestError::Header)?
        .unwrap_or_default();

    for challenge in challenges {
        let AuthChallenge::Digest(challenge) = challenge else {
            continue;
        };

        if !dst.iter().any(|(_, c)| c.realm == challenge.realm) {
            dst.push((is_proxy, challenge));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::msg::StatusLine;
    use sip_types::uri::SipUri;
    use sip_types::{Code, Method};

    fn authenticator() -> DigestAuthenticator {
        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("example.org", DigestUser::new("user123", "password123"));

        DigestAuthenticator::new(credentials)
    }

    fn register_line() -> RequestLine {
        RequestLine {
            method: Method::REGISTER,
            uri: "sip:example.org".parse::<SipUri>().unwrap(),
        }
    }

    fn challenge(qop: Vec<QopOption>, stale: bool, nonce: &'static str) -> Headers {
        let mut headers = Headers::new();

        headers.insert_type(
            Name::WWW_AUTHENTICATE,
            &AuthChallenge::Digest(DigestChallenge {
                realm: "example.org".into(),
                domain: None,
                nonce: nonce.into(),
                opaque: None,
                stale,
                algorithm: Algorithm::MD5,
                qop,
                other: vec![],
            }),
        );

        headers
    }

    fn reject(
        auth: &mut DigestAuthenticator,
        line: &RequestLine,
        headers: &Headers,
    ) -> Result<(), DigestError> {
        auth.handle_rejection(
            RequestParts {
                line,
                headers: &Headers::new(),
                body: &[],
            },
            ResponseParts {
                line: &StatusLine::new(Code::UNAUTHORIZED),
                headers,
                body: &[],
            },
        )
    }

    fn authorization(auth: &mut DigestAuthenticator, line: &RequestLine) -> DigestResponse {
        let mut headers = Headers::new();
        auth.authorize_request(line, &mut headers);

        match headers.get::<AuthResponse>(Name::AUTHORIZATION).unwrap() {
            AuthResponse::Digest(digest) => digest,
            AuthResponse::Other { .. } => panic!("expected digest"),
        }
    }

    #[test]
    fn digest_without_qop() {
        let mut auth = authenticator();
        let line = register_line();

        reject(&mut auth, &line, &challenge(vec![], false, "YWmh5GFpoLjiTDCA1hTSSygkgdj99aHE"))
            .unwrap();

        let digest = authorization(&mut auth, &line);

        assert_eq!(digest.username, "user123");
        assert_eq!(digest.realm, "example.org");
        assert_eq!(digest.nonce, "YWmh5GFpoLjiTDCA1hTSSygkgdj99aHE");
        assert_eq!(digest.uri, "sip:example.org");
        assert_eq!(digest.response, "bc185e4893f17f12dc53153d2a62e6a6");
        assert_eq!(digest.algorithm, Algorithm::MD5);
        assert_eq!(digest.qop_response, None);
    }

    #[test]
    fn qop_auth_increments_nonce_count() {
        let mut auth = authenticator();
        let line = register_line();

        reject(&mut auth, &line, &challenge(vec![QopOption::Auth], false, "abc")).unwrap();

        let first = authorization(&mut auth, &line);
        let second = authorization(&mut auth, &line);

        let first_qop = first.qop_response.as_ref().unwrap();
        assert_eq!(first_qop.qop, QopOption::Auth);
        assert_eq!(first_qop.nc, 1);
        assert_eq!(second.qop_response.as_ref().unwrap().nc, 2);
        assert_ne!(first.response, second.response);
    }

    #[test]
    fn rejected_twice_fails() {
        let mut auth = authenticator();
        let line = register_line();

        reject(&mut auth, &line, &challenge(vec![], false, "n1")).unwrap();

        let err = reject(&mut auth, &line, &challenge(vec![], false, "n2")).unwrap_err();
        assert!(matches!(err, DigestError::FailedToAuthenticate(realms) if realms == ["example.org"]));
    }

    #[test]
    fn stale_nonce_is_retried_once() {
        let mut auth = authenticator();
        let line = register_line();

        reject(&mut auth, &line, &challenge(vec![], false, "n1")).unwrap();
        reject(&mut auth, &line, &challenge(vec![], true, "n2")).unwrap();

        assert_eq!(authorization(&mut auth, &line).nonce, "n2");

        assert!(reject(&mut auth, &line, &challenge(vec![], true, "n3")).is_err());
    }

    #[test]
    fn unsupported_qop_and_missing_challenge() {
        let mut auth = authenticator();
        let line = register_line();

        assert!(matches!(
            reject(&mut auth, &line, &challenge(vec![QopOption::AuthInt], false, "n1")),
            Err(DigestError::FailedToAuthenticate(_))
        ));

        assert!(matches!(
            reject(&mut auth, &line, &Headers::new()),
            Err(DigestError::NoChallenge)
        ));
    }

    #[test]
    fn default_credentials_for_unknown_realm() {
        let mut credentials = DigestCredentials::new();
        credentials.set_default(DigestUser::new("alice", "secret"));

        assert_eq!(credentials.get_for_realm("any.example").unwrap().user, "alice");

        credentials.add_for_realm("atlanta.example", DigestUser::new("bob", "pw"));
        assert_eq!(credentials.get_for_realm("atlanta.example").unwrap().user, "bob");
    }
}
