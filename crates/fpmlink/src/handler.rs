//! The public face of the bridge: `start`, `handle_request`, `stop`.

use crate::config::Config;
use crate::error::Error;
use crate::event::{Context, HeaderValue, HttpRequestEvent, HttpResponse};
use crate::interrupt::DeadlineInterrupter;
use crate::response;
use crate::supervisor::{StdDeps, Supervisor, SupervisorDeps};
use crate::translate::RequestTranslator;
use fpmlink_fcgi::client::Client;
use slog::{debug, o, Logger};
use std::collections::HashMap;
use std::io::Write as _;

/// Returned when the worker runtime cannot be reached. Operators alert on the
/// `Code: 4711` token; do not reword it.
const ERROR_PAGE: &str = "\
<html lang=\"en\">\
<head><title>Internal Server Error</title></head>\
<body style=\"margin: 4em auto; max-width: 40em; font-family: sans-serif\">\
<h1>Internal Server Error</h1>\
<p>Error communicating with the local worker runtime. Code: 4711</p>\
</body>\
</html>";

/// Serves platform invocations from a supervised worker runtime. The runtime
/// loop calls `start` once, `handle_request` per invocation, and `stop` on
/// shutdown; nothing here is safe for concurrent use, matching the one
/// invocation the platform ever has in flight.
pub struct FpmHandler<DepsT: SupervisorDeps = StdDeps> {
    supervisor: Supervisor<DepsT>,
    client: Client,
    translator: RequestTranslator,
    interrupter: Option<DeadlineInterrupter>,
    log: Logger,
}

impl FpmHandler<StdDeps> {
    /// A facade over the real operating system.
    pub fn new(config: Config, log: Logger) -> Self {
        Self::with_deps(StdDeps::new(), config, log)
    }
}

impl<DepsT: SupervisorDeps> FpmHandler<DepsT> {
    /// A facade with substituted supervisor dependencies, for tests.
    pub fn with_deps(deps: DepsT, config: Config, log: Logger) -> Self {
        let interrupter = DeadlineInterrupter::install(log.new(o!("component" => "deadline")));
        FpmHandler {
            client: Client::new(&config.socket_path, log.new(o!("component" => "fastcgi"))),
            translator: RequestTranslator::new(&config.handler),
            supervisor: Supervisor::new(deps, config, log.new(o!("component" => "supervisor"))),
            interrupter: Some(interrupter),
            log,
        }
    }

    /// Start the worker runtime. Fatal on failure: without a worker there is
    /// nothing to serve.
    pub fn start(&mut self) -> Result<(), Error> {
        self.supervisor.start()
    }

    /// Serve one platform invocation.
    pub fn handle_request(
        &mut self,
        event: &HttpRequestEvent,
        context: &Context,
    ) -> Result<HttpResponse, Error> {
        // Exact shape is a contract: platform log ingestion keys on it.
        eprintln!("URL RequestId: {} Path: {}", context.aws_request_id, event.uri);
        self.supervisor.begin_request();
        let outcome = self.dispatch(event, context);
        self.supervisor.end_request();
        match outcome {
            // The worker is likely mid-request; the next invocation's probe
            // settles whether it recovered.
            Err(Error::DeadlineReached) => Err(Error::DeadlineReached),
            outcome => {
                self.supervisor.probe_liveness()?;
                outcome
            }
        }
    }

    /// Shut the worker runtime down. Idempotent.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.supervisor.stop()
    }

    fn dispatch(
        &mut self,
        event: &HttpRequestEvent,
        context: &Context,
    ) -> Result<HttpResponse, Error> {
        let request = match self.translator.translate(event, context) {
            Ok(request) => request,
            Err(err) => return Ok(self.fail_invocation(&err)),
        };
        if let Some(interrupter) = &self.interrupter {
            interrupter.enable(context.remaining_millis())?;
        }
        let result = self.client.send_request(&request, |handle| {
            if let Some(interrupter) = &self.interrupter {
                interrupter.watch(handle);
            }
        });
        let fired = self
            .interrupter
            .as_ref()
            .map(|interrupter| interrupter.fired())
            .unwrap_or(false);
        if let Some(interrupter) = &self.interrupter {
            interrupter.reset();
        }

        match result {
            Ok(fcgi_response) => {
                if !fcgi_response.stderr.is_empty() {
                    // The worker's FastCGI stderr stream belongs in the
                    // platform logs like everything else it prints.
                    let _ = std::io::stderr().write_all(&fcgi_response.stderr);
                }
                match response::translate_response(&fcgi_response.stdout, event.has_multi_header)
                {
                    Ok(http_response) => Ok(http_response),
                    Err(err) => Ok(self.fail_invocation(&err)),
                }
            }
            Err(_) if fired => Err(Error::DeadlineReached),
            Err(err) => Ok(self.fail_invocation(&err)),
        }
    }

    /// Per-invocation failure: write the contract line and answer with the
    /// fixed 500 page instead of poisoning the supervisor.
    fn fail_invocation(&self, err: &dyn std::error::Error) -> HttpResponse {
        // Exact prefix is a contract.
        eprintln!("Exception: {err}");
        debug!(self.log, "invocation failed"; "err" => %err);
        HttpResponse {
            status: 500,
            headers: HashMap::from([(
                "content-type".to_string(),
                HeaderValue::Single("text/html".to_string()),
            )]),
            body: ERROR_PAGE.as_bytes().to_vec(),
        }
    }
}
