use tonic::{Request, Status};
use x509_parser::prelude::*;

/// The authenticated tenant identity carried on every request.
#[derive(Clone)]
pub struct TenantExtension {
    pub tenant: String,
}

/// A tonic interceptor service function.
///
/// Pulls the subject Common Name out of the verified peer certificate and
/// attaches it to the request extensions as the tenant identity. Requests
/// without a usable identity never reach a handler.
pub fn extract_peer_identity(mut req: Request<()>) -> Result<Request<()>, Status> {
    let tenant = {
        let certs = req
            .peer_certs()
            .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?;
        let der = certs
            .first()
            .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?;
        let (rem, cert) = X509Certificate::from_der(der.as_ref())
            .map_err(|_| Status::unauthenticated("malformed client certificate"))?;
        if !rem.is_empty() {
            return Err(Status::unauthenticated("malformed client certificate"));
        }
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .unwrap_or("");
        if cn.is_empty() {
            return Err(Status::unauthenticated(
                "client certificate has no common name",
            ));
        }
        cn.to_string()
    };
    req.extensions_mut().insert(TenantExtension { tenant });
    Ok(req)
}
