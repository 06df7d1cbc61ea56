use std::time::Instant;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        MatchedPath, Path, Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::histogram;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use loanbook_core::types::{
    Investor, InvestorLookup, InvestorsFilter, Loan, LoanInvestment, LoanInvestmentLookup,
    LoanInvestmentsFilter, LoansFilter,
};

use crate::investors::{AddInvestorInput, InvestmentService, InvestorService};
use crate::loans::{
    ApproveLoanInput, DisburseLoanInput, InvestLoanInput, LoanService, ProposeLoanInput,
};
use crate::problem::ProblemResponse;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    loans: LoanService,
    investors: InvestorService,
    investments: InvestmentService,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        loans: LoanService,
        investors: InvestorService,
        investments: InvestmentService,
    ) -> Self {
        Self {
            metrics,
            loans,
            investors,
            investments,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/loans", post(propose_loan).get(list_loans))
        .route("/loans/:id", get(get_loan))
        .route("/loans/:id/approve", post(approve_loan))
        .route(
            "/loans/:id/investments",
            post(invest_loan).get(list_loan_investments),
        )
        .route(
            "/loans/:id/investments/:investor_id",
            get(get_loan_investment),
        )
        .route("/loans/:id/disburse", post(disburse_loan))
        .route("/loans/:id/agreement", get(agreement_letter))
        .route("/investors", post(add_investor).get(list_investors))
        .route("/investors/:id", get(get_investor))
        .route_layer(middleware::from_fn(track_latency))
        .with_state(state)
}

type ApiResult<T> = Result<T, ProblemResponse>;

#[derive(Debug, Serialize)]
struct Listing<T> {
    items: Vec<T>,
    total: i64,
}

#[derive(Debug, Serialize)]
struct AgreementLink {
    kind: AgreementKind,
    url: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum AgreementKind {
    #[default]
    Draft,
    Signed,
}

#[derive(Debug, Default, Deserialize)]
struct AgreementQuery {
    #[serde(default)]
    kind: AgreementKind,
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ProblemResponse::bad_request(rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    params
        .map(|Query(value)| value)
        .map_err(|rejection| ProblemResponse::bad_request(rejection.body_text()))
}

fn path_params<T>(params: Result<Path<T>, PathRejection>) -> ApiResult<T> {
    params
        .map(|Path(value)| value)
        .map_err(|rejection| ProblemResponse::bad_request(rejection.body_text()))
}

async fn track_latency(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();
    let response = next.run(request).await;
    histogram!("http_request_duration_seconds", "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn propose_loan(
    State(state): State<AppState>,
    payload: Result<Json<ProposeLoanInput>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Loan>)> {
    let loan = state.loans.propose_loan(json_body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(loan)))
}

async fn list_loans(
    State(state): State<AppState>,
    params: Result<Query<LoansFilter>, QueryRejection>,
) -> ApiResult<Json<Listing<Loan>>> {
    let filter = query(params)?;
    let items = state.loans.loans(&filter).await?;
    let total = state.loans.count_loans(&filter).await?;
    Ok(Json(Listing { items, total }))
}

async fn get_loan(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Loan>> {
    Ok(Json(state.loans.loan(path_params(id)?).await?))
}

async fn approve_loan(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ApproveLoanInput>, JsonRejection>,
) -> ApiResult<Json<Loan>> {
    let input = ApproveLoanInput {
        id: path_params(id)?,
        ..json_body(payload)?
    };
    Ok(Json(state.loans.approve_loan(input).await?))
}

async fn invest_loan(
    State(state): State<AppState>,
    loan_id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<InvestLoanInput>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<LoanInvestment>)> {
    let input = InvestLoanInput {
        loan_id: path_params(loan_id)?,
        ..json_body(payload)?
    };
    let investment = state.loans.invest_loan(input).await?;
    Ok((StatusCode::CREATED, Json(investment)))
}

async fn list_loan_investments(
    State(state): State<AppState>,
    loan_id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Listing<LoanInvestment>>> {
    let loan_id = path_params(loan_id)?;
    state.loans.loan(loan_id).await?;
    let filter = LoanInvestmentsFilter::for_loan(loan_id);
    let items = state.investments.loan_investments(&filter).await?;
    let total = state.investments.count_loan_investments(&filter).await?;
    Ok(Json(Listing { items, total }))
}

async fn get_loan_investment(
    State(state): State<AppState>,
    ids: Result<Path<(i64, i64)>, PathRejection>,
) -> ApiResult<Json<LoanInvestment>> {
    let (loan_id, investor_id) = path_params(ids)?;
    let lookup = LoanInvestmentLookup::for_investor(loan_id, investor_id);
    Ok(Json(state.investments.loan_investment(&lookup).await?))
}

async fn disburse_loan(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<DisburseLoanInput>, JsonRejection>,
) -> ApiResult<Json<Loan>> {
    let input = DisburseLoanInput {
        id: path_params(id)?,
        ..json_body(payload)?
    };
    Ok(Json(state.loans.disburse_loan(input).await?))
}

async fn agreement_letter(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    params: Result<Query<AgreementQuery>, QueryRejection>,
) -> ApiResult<Json<AgreementLink>> {
    let id = path_params(id)?;
    let kind = query(params)?.kind;
    let url = match kind {
        AgreementKind::Draft => state.loans.draft_agreement_letter(id).await?,
        AgreementKind::Signed => state.loans.signed_agreement_letter(id).await?,
    };
    Ok(Json(AgreementLink { kind, url }))
}

async fn add_investor(
    State(state): State<AppState>,
    payload: Result<Json<AddInvestorInput>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Investor>)> {
    let investor = state.investors.add_investor(json_body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(investor)))
}

async fn list_investors(State(state): State<AppState>) -> ApiResult<Json<Listing<Investor>>> {
    let filter = InvestorsFilter::default();
    let items = state.investors.investors(&filter).await?;
    let total = state.investors.count_investors(&filter).await?;
    Ok(Json(Listing { items, total }))
}

async fn get_investor(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Investor>> {
    let lookup = InvestorLookup::by_id(path_params(id)?);
    Ok(Json(state.investors.investor(&lookup).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::testing::Harness;

    fn router(harness: &Harness) -> Router {
        let metrics = telemetry::init_metrics().expect("metrics init");
        app_router(AppState::new(
            metrics,
            harness.loans.clone(),
            harness.investors.clone(),
            harness.investments.clone(),
        ))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone()
            .oneshot(request)
            .await
            .expect("handler should respond")
    }

    async fn json_of(response: Response) -> Value {
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        serde_json::from_slice(&collected.to_bytes()).expect("json body")
    }

    fn proposal() -> Value {
        json!({ "userId": 21, "amount": 1000, "rate": 12.5, "term": 10, "termUnit": "WEEKLY" })
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let harness = Harness::new().await;
        let response = call(&router(&harness), "GET", "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let harness = Harness::new().await;
        let response = call(&router(&harness), "GET", "/metrics", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn propose_returns_camel_case_loan() {
        let harness = Harness::new().await;
        let app = router(&harness);

        let response = call(&app, "POST", "/loans", Some(proposal())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_of(response).await;
        assert_eq!(body["status"], "PROPOSED");
        assert_eq!(body["userId"], 21);
        assert_eq!(body["investedAmount"], 0);
        assert_eq!(body["termUnit"], "WEEKLY");

        let id = body["id"].as_i64().expect("id");
        let fetched = json_of(call(&app, "GET", &format!("/loans/{id}"), None).await).await;
        assert_eq!(fetched, body);
    }

    #[tokio::test]
    async fn validation_errors_are_problem_documents() {
        let harness = Harness::new().await;
        let app = router(&harness);

        let mut input = proposal();
        input["amount"] = json!(0);
        let response = call(&app, "POST", "/loans", Some(input)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        let body = json_of(response).await;
        assert_eq!(body["type"], "invalid_request");
        assert_eq!(body["detail"], "amount is required");

        let response = call(&app, "GET", "/loans?status=PAID", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_loan_is_not_found() {
        let harness = Harness::new().await;
        let app = router(&harness);

        let response = call(&app, "GET", "/loans/404", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_of(response).await["detail"], "loan not found");

        let response = call(&app, "GET", "/loans/404/investments", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn approve_invest_and_list_through_routes() {
        let harness = Harness::new().await;
        let app = router(&harness);
        let investor = harness.investor("ana@example.com").await;

        let loan = json_of(call(&app, "POST", "/loans", Some(proposal())).await).await;
        let id = loan["id"].as_i64().expect("id");

        let invest = json!({ "investorId": investor.id, "amount": 400 });
        let response = call(
            &app,
            "POST",
            &format!("/loans/{id}/investments"),
            Some(invest.clone()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            json_of(response).await["detail"],
            "only approved loan can be invested"
        );

        let approve = json!({ "employeeId": 7, "photoProofUrl": "https://files.test/p.jpg" });
        let response = call(&app, "POST", &format!("/loans/{id}/approve"), Some(approve)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["status"], "APPROVED");

        let response = call(&app, "POST", &format!("/loans/{id}/investments"), Some(invest)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let recorded = json_of(response).await;
        assert_eq!(recorded["loanId"], id);
        assert_eq!(recorded["amount"], 400);

        let listed = json_of(
            call(&app, "GET", &format!("/loans/{id}/investments"), None).await,
        )
        .await;
        assert_eq!(listed["total"], 1);

        let filtered = json_of(call(&app, "GET", "/loans?userId=21&status=APPROVED", None).await).await;
        assert_eq!(filtered["total"], 1);
        assert_eq!(filtered["items"][0]["investedAmount"], 400);
        let none = json_of(call(&app, "GET", "/loans?status=DISBURSED", None).await).await;
        assert_eq!(none["total"], 0);
    }

    #[tokio::test]
    async fn agreement_route_reports_state() {
        let harness = Harness::new().await;
        let app = router(&harness);
        let loan = harness.approved_loan(1_000).await;

        let response = call(&app, "GET", &format!("/loans/{}/agreement", loan.id), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_of(response).await["detail"], "loan is not fully funded yet");

        let response = call(
            &app,
            "GET",
            &format!("/loans/{}/agreement?kind=signed", loan.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = call(
            &app,
            "GET",
            &format!("/loans/{}/agreement?kind=final", loan.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn investors_register_once() {
        let harness = Harness::new().await;
        let app = router(&harness);

        let body = json!({ "email": "ana@example.com" });
        let response = call(&app, "POST", "/investors", Some(body.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_of(response).await["email"], "ana@example.com");

        let response = call(&app, "POST", "/investors", Some(body)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let listed = json_of(call(&app, "GET", "/investors", None).await).await;
        assert_eq!(listed["total"], 1);
    }

    #[tokio::test]
    async fn non_numeric_id_is_a_problem_document() {
        let harness = Harness::new().await;
        let app = router(&harness);

        for uri in ["/loans/abc", "/loans/abc/agreement", "/investors/x"] {
            let response = call(&app, "GET", uri, None).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(
                response.headers().get(header::CONTENT_TYPE).unwrap(),
                "application/problem+json"
            );
            assert_eq!(json_of(response).await["type"], "invalid_request");
        }

        let approve = json!({ "employeeId": 7, "photoProofUrl": "https://files.test/p.jpg" });
        let response = call(&app, "POST", "/loans/1.5/approve", Some(approve)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn single_investor_and_holding_lookups() {
        let harness = Harness::new().await;
        let app = router(&harness);
        let ana = harness.investor("ana@example.com").await;
        let ben = harness.investor("ben@example.com").await;
        let loan = harness.approved_loan(1_000).await;
        harness
            .loans
            .invest_loan(InvestLoanInput {
                loan_id: loan.id,
                investor_id: ana.id,
                amount: 250,
            })
            .await
            .expect("invest");

        let response = call(&app, "GET", &format!("/investors/{}", ana.id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["email"], "ana@example.com");

        let response = call(&app, "GET", "/investors/404", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let uri = format!("/loans/{}/investments/{}", loan.id, ana.id);
        let response = call(&app, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let held = json_of(response).await;
        assert_eq!(held["amount"], 250);
        assert_eq!(held["investorId"], ana.id);

        let uri = format!("/loans/{}/investments/{}", loan.id, ben.id);
        let response = call(&app, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_of(response).await["detail"],
            "loan investment not found"
        );
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let harness = Harness::new().await;
        let app = router(&harness);

        let request = Request::builder()
            .method("POST")
            .uri("/investors")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.expect("handler should respond");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
