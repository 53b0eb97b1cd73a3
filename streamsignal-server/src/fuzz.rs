#![cfg(test)]

use axum::{
    extract::{ws::Message, FromRequestParts},
    http::{self, request},
};
use bolero::generator::TypeGenerator;
use futures::{channel::mpsc, StreamExt};
use streamsignal_api::{
    ActionResult, AuthToken, ChangeKind, ChannelSpec, ClientMessage, Comment, CommentId,
    Error as ApiError, FeedMessage, Filter, NewComment, NewReview, NewVote, Ratings, Reaction,
    Review, ReviewId, Service, Store, SubscribeStatus, Table, UserId, UserReactions, Uuid,
    VoteOutcome, MAX_NESTING_LEVEL,
};
use streamsignal_client::{tree, ReviewThread};
use streamsignal_mock_server::MockServer;
use std::{cmp, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe};
use tower::{Service as _, ServiceExt};

use crate::{extractors::*, *};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

async fn call<Req, Resp>(
    app: &mut Router,
    req: request::Request<axum::body::Body>,
    req_body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    if status == http::StatusCode::OK {
        return Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
            panic!(
                r#"
                    Failed parsing resp body!

                    The error is the following:
                    ---
                    {err}
                    ---

                    Response body is:
                    ---
                    {body:?}
                    ---

                    Request was:
                    ---
                    {req_body:?}
                    ---
                "#
            )
        }));
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<AuthToken>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("bearer {}", token.0)),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ))
        .expect("building request");
    call(app, req, body).await
}

async fn act<Req, Resp>(
    app: &mut Router,
    uri: &str,
    token: Option<AuthToken>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let res: ActionResult<Resp> = run_on_app(app, "POST", uri, token, body).await?;
    assert!(res.success, "successful status code with failed action result");
    Ok(res.into_result().expect("action result without data"))
}

fn ratings(overall: u8) -> Ratings {
    Ratings {
        overall,
        content: 3,
        value: 4,
        usability: 4,
        streaming_quality: 2,
    }
}

struct TestApp {
    app: Router,
    feeds: Feeds,
    service: Service,
    user: UserId,
    token: AuthToken,
}

impl TestApp {
    fn new() -> TestApp {
        let mock = MockServer::new();
        let service = mock.test_add_service("flixnet", "Flixnet");
        mock.test_add_service("anime-box", "Anime Box");
        let (user, token) = mock.test_add_user("alice");
        let feeds = Feeds::new();
        let app = app(Arc::new(mock.clone()), feeds.clone());
        TestApp {
            app,
            feeds,
            service,
            user,
            token,
        }
    }

    async fn review(&mut self) -> Review {
        let new = NewReview {
            id: ReviewId(Uuid::new_v4()),
            service_id: self.service.id,
            ratings: ratings(4),
            content: String::from("good value"),
        };
        act(&mut self.app, "/api/reviews", Some(self.token), &new)
            .await
            .expect("submitting review")
    }

    async fn comment(
        &mut self,
        review: ReviewId,
        parent: Option<CommentId>,
        content: &str,
    ) -> Result<Comment, ApiError> {
        let new = NewComment {
            id: CommentId(Uuid::new_v4()),
            review_id: review,
            parent_comment_id: parent,
            content: String::from(content),
        };
        act(&mut self.app, "/api/comments", Some(self.token), &new).await
    }
}

#[tokio::test]
async fn services_listing() {
    let mut t = TestApp::new();
    let services: Vec<Service> = run_on_app(&mut t.app, "GET", "/api/services", None, &())
        .await
        .unwrap();
    let names = services.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Anime Box", "Flixnet"]);

    let service: Service = run_on_app(&mut t.app, "GET", "/api/services/flixnet", None, &())
        .await
        .unwrap();
    assert_eq!(service, t.service);
    let missing: Result<Service, _> =
        run_on_app(&mut t.app, "GET", "/api/services/nope", None, &()).await;
    assert_eq!(missing, Err(ApiError::ServiceNotFound(String::from("nope"))));
}

#[tokio::test]
async fn reviews_require_a_session() {
    let mut t = TestApp::new();
    let new = NewReview {
        id: ReviewId(Uuid::new_v4()),
        service_id: t.service.id,
        ratings: ratings(5),
        content: String::from("love it"),
    };
    let anonymous: Result<Review, _> = act(&mut t.app, "/api/reviews", None, &new).await;
    assert_eq!(anonymous, Err(ApiError::PermissionDenied));
    let forged: Result<Review, _> =
        act(&mut t.app, "/api/reviews", Some(AuthToken(Uuid::new_v4())), &new).await;
    assert_eq!(forged, Err(ApiError::PermissionDenied));

    let mut bad = new.clone();
    bad.ratings = ratings(0);
    let bad: Result<Review, _> = act(&mut t.app, "/api/reviews", Some(t.token), &bad).await;
    assert_eq!(bad, Err(ApiError::InvalidRating(0)));

    let review: Review = act(&mut t.app, "/api/reviews", Some(t.token), &new)
        .await
        .unwrap();
    assert_eq!((review.id, review.user_id), (new.id, t.user));
    assert_eq!(review.author_name, "alice");

    let uri = format!("/api/services/{}/reviews", t.service.id.0);
    let listed: Vec<Review> = run_on_app(&mut t.app, "GET", &uri, None, &()).await.unwrap();
    assert_eq!(listed, vec![review]);
    let uri = format!("/api/services/{}/reviews", Uuid::new_v4());
    let missing: Result<Vec<Review>, _> = run_on_app(&mut t.app, "GET", &uri, None, &()).await;
    assert!(matches!(missing, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn comment_tree_with_reactions() {
    let mut t = TestApp::new();
    let review = t.review().await;
    let top = t.comment(review.id, None, "anyone tried the 4k tier?").await.unwrap();
    let reply = t.comment(review.id, Some(top.id), "yes, worth it").await.unwrap();
    let nested = t.comment(review.id, Some(reply.id), "agreed").await.unwrap();
    assert_eq!(
        t.comment(review.id, None, "  ").await.unwrap_err(),
        ApiError::EmptyContent
    );

    let uri = format!("/api/reviews/{}/comments", review.id.0);
    let anonymous: Vec<Comment> = run_on_app(&mut t.app, "GET", &uri, None, &()).await.unwrap();
    let ids = tree::flatten(&anonymous)
        .into_iter()
        .map(|c| (c.id, c.nesting_level))
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![(top.id, 1), (reply.id, 2), (nested.id, 3)]);

    let like = NewVote {
        review_id: review.id,
        comment_id: Some(reply.id),
        vote_type: Reaction::Like,
    };
    let outcome: VoteOutcome = act(&mut t.app, "/api/votes", Some(t.token), &like)
        .await
        .unwrap();
    assert_eq!(outcome, VoteOutcome { previous: None, current: Some(Reaction::Like) });

    let own: Vec<Comment> = run_on_app(&mut t.app, "GET", &uri, Some(t.token), &())
        .await
        .unwrap();
    let r = tree::find_comment(&own, &reply.id).unwrap();
    assert_eq!((r.likes, r.user_reaction), (1, Some(Reaction::Like)));
    let anonymous: Vec<Comment> = run_on_app(&mut t.app, "GET", &uri, None, &()).await.unwrap();
    assert_eq!(tree::find_comment(&anonymous, &reply.id).unwrap().user_reaction, None);

    let outcome: VoteOutcome = act(&mut t.app, "/api/votes", Some(t.token), &like)
        .await
        .unwrap();
    assert_eq!(outcome.current, None);
    let own: Vec<Comment> = run_on_app(&mut t.app, "GET", &uri, Some(t.token), &())
        .await
        .unwrap();
    let r = tree::find_comment(&own, &reply.id).unwrap();
    assert_eq!((r.likes, r.user_reaction), (0, None));
}

#[tokio::test]
async fn replies_stay_in_their_review() {
    let mut t = TestApp::new();
    let first = t.review().await;
    let second = t.review().await;
    let top = t.comment(first.id, None, "hello").await.unwrap();
    assert_eq!(
        t.comment(second.id, Some(top.id), "hi").await.unwrap_err(),
        ApiError::ParentInOtherReview(top.id.0)
    );
    let missing = CommentId(Uuid::new_v4());
    assert_eq!(
        t.comment(first.id, Some(missing), "hi").await.unwrap_err(),
        ApiError::NotFound(missing.0)
    );
}

#[tokio::test]
async fn reply_chains_are_capped() {
    let mut t = TestApp::new();
    let review = t.review().await;
    let mut parent = None;
    for level in 1..=MAX_NESTING_LEVEL {
        let c = t.comment(review.id, parent, &format!("level {level}")).await.unwrap();
        parent = Some(c.id);
    }
    let deepest = parent.unwrap();
    assert_eq!(
        t.comment(review.id, Some(deepest), "one more").await.unwrap_err(),
        ApiError::ReplyTooDeep(deepest.0)
    );

    let uri = format!("/api/reviews/{}/comments", review.id.0);
    let thread: Vec<Comment> = run_on_app(&mut t.app, "GET", &uri, None, &()).await.unwrap();
    let levels = tree::flatten(&thread)
        .into_iter()
        .map(|c| c.nesting_level)
        .collect::<Vec<_>>();
    assert_eq!(levels, (1..=MAX_NESTING_LEVEL).collect::<Vec<_>>());
}

#[tokio::test]
async fn review_reaction_survives_reload() {
    let mut t = TestApp::new();
    let review = t.review().await;
    let like = NewVote {
        review_id: review.id,
        comment_id: None,
        vote_type: Reaction::Like,
    };
    let _: VoteOutcome = act(&mut t.app, "/api/votes", Some(t.token), &like)
        .await
        .unwrap();

    let uri = format!("/api/reviews/{}/reactions", review.id.0);
    let anonymous: Result<UserReactions, _> = run_on_app(&mut t.app, "GET", &uri, None, &()).await;
    assert_eq!(anonymous, Err(ApiError::PermissionDenied));
    let reactions: UserReactions = run_on_app(&mut t.app, "GET", &uri, Some(t.token), &())
        .await
        .unwrap();
    assert_eq!(reactions.review, Some(Reaction::Like));

    let reviews_uri = format!("/api/services/{}/reviews", t.service.id.0);
    let reviews: Vec<Review> = run_on_app(&mut t.app, "GET", &reviews_uri, None, &())
        .await
        .unwrap();
    let mut thread = ReviewThread::from_tree(&reviews[0], Some(t.user), Vec::new(), reactions.review);
    assert_eq!(thread.likes(), 1);

    // clicking like again takes it back, on both sides
    let expected = thread.toggle_review(Reaction::Like);
    let outcome: VoteOutcome = act(&mut t.app, "/api/votes", Some(t.token), &like)
        .await
        .unwrap();
    assert_eq!(outcome, expected);
    let reviews: Vec<Review> = run_on_app(&mut t.app, "GET", &reviews_uri, None, &())
        .await
        .unwrap();
    assert_eq!((thread.likes(), thread.dislikes()), (reviews[0].likes, reviews[0].dislikes));
    assert_eq!((thread.likes(), thread.reaction()), (0, None));
}

fn feed_message(m: Option<Message>) -> FeedMessage {
    match m {
        Some(Message::Text(json)) => serde_json::from_str(&json).expect("parsing feed message"),
        m => panic!("unexpected websocket message {m:?}"),
    }
}

#[tokio::test]
async fn realtime_feed_relays_matching_changes() {
    let mut t = TestApp::new();
    let review = t.review().await;
    let (write, mut written) = mpsc::unbounded::<Message>();
    let (client, read) = mpsc::unbounded::<Result<Message, axum::Error>>();
    tokio::spawn(t.feeds.clone().serve(write, read));

    let send = |msg: ClientMessage| {
        let json = serde_json::to_string(&msg).unwrap();
        client.unbounded_send(Ok(Message::Text(json))).unwrap();
    };
    send(ClientMessage::Ping);
    assert_eq!(feed_message(written.next().await), FeedMessage::Pong);

    let spec = ChannelSpec {
        table: Table::Comments,
        filter: Filter::eq("review_id", review.id.0),
    };
    send(ClientMessage::Subscribe {
        channel: String::from("thread"),
        spec,
    });
    assert_eq!(
        feed_message(written.next().await),
        FeedMessage::Status {
            channel: String::from("thread"),
            status: SubscribeStatus::Subscribed,
        }
    );

    let other = t.review().await;
    t.comment(other.id, None, "elsewhere").await.unwrap();
    let c = t.comment(review.id, None, "here").await.unwrap();
    match feed_message(written.next().await) {
        FeedMessage::Change { channel, event } => {
            assert_eq!(channel, "thread");
            assert_eq!((event.table, event.kind), (Table::Comments, ChangeKind::Insert));
            assert_eq!(event.new["id"], c.id.0.to_string());
        }
        m => panic!("unexpected feed message {m:?}"),
    }

    send(ClientMessage::Unsubscribe {
        channel: String::from("thread"),
    });
    assert_eq!(
        feed_message(written.next().await),
        FeedMessage::Status {
            channel: String::from("thread"),
            status: SubscribeStatus::Closed,
        }
    );
    drop(client);
    assert!(written.next().await.is_none());
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    Comment {
        parent: Option<usize>,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        content: String,
    },
    Vote {
        target: Option<usize>,
        like: bool,
    },
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res, mock_res,
        "app and mock did not return the same result for {name}"
    );
}

/// Runs the same operations through the http app and directly against a
/// reference store
struct ComparativeFuzzer {
    app: Router,
    app_token: AuthToken,
    reference: MockServer,
    reference_user: UserId,
    review: ReviewId,
    comments: Vec<CommentId>,
}

impl ComparativeFuzzer {
    async fn new() -> ComparativeFuzzer {
        let review = ReviewId(Uuid::new_v4());
        let mut stores = Vec::new();
        for _ in 0..2 {
            let mock = MockServer::new();
            let s = mock.test_add_service("flixnet", "Flixnet");
            let (user, token) = mock.test_add_user("fuzzer");
            let new = NewReview {
                id: review,
                service_id: s.id,
                ratings: ratings(3),
                content: String::from("fuzzed"),
            };
            mock.submit_review(user, new).await.expect("submitting review");
            stores.push((mock, user, token));
        }
        let (reference, reference_user, _) = stores.pop().expect("reference store");
        let (app_store, _, app_token) = stores.pop().expect("app store");
        ComparativeFuzzer {
            app: app(Arc::new(app_store), Feeds::new()),
            app_token,
            reference,
            reference_user,
            review,
            comments: Vec::new(),
        }
    }

    fn pick(&self, id: Option<usize>) -> Option<CommentId> {
        id.and_then(|id| resize_int(id, ..self.comments.len()))
            .map(|i| self.comments[i])
    }

    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::Comment { parent, content } => {
                let new = NewComment {
                    id: CommentId(Uuid::new_v4()),
                    review_id: self.review,
                    parent_comment_id: self.pick(parent),
                    content,
                };
                let app_res: Result<Comment, _> =
                    act(&mut self.app, "/api/comments", Some(self.app_token), &new).await;
                let mock_res = self
                    .reference
                    .submit_comment(self.reference_user, new.clone())
                    .await
                    .map(|(c, _)| c);
                if mock_res.is_ok() {
                    self.comments.push(new.id);
                }
                compare("Comment", app_res.map(|c| c.id), mock_res.map(|c| c.id));
            }
            FuzzOp::Vote { target, like } => {
                let vote = NewVote {
                    review_id: self.review,
                    comment_id: self.pick(target),
                    vote_type: if like { Reaction::Like } else { Reaction::Dislike },
                };
                let app_res: Result<VoteOutcome, _> =
                    act(&mut self.app, "/api/votes", Some(self.app_token), &vote).await;
                let mock_res = self
                    .reference
                    .submit_vote(self.reference_user, vote)
                    .await
                    .map(|(o, _)| o);
                compare("Vote", app_res, mock_res);
            }
        }
    }

    async fn check_trees(&mut self) {
        let uri = format!("/api/reviews/{}/comments", self.review.0);
        let app_tree: Vec<Comment> = run_on_app(&mut self.app, "GET", &uri, Some(self.app_token), &())
            .await
            .expect("fetching comment tree");
        let (top_level, replies) = self
            .reference
            .fetch_comments(self.review)
            .await
            .expect("fetching reference comments");
        let reactions = self
            .reference
            .fetch_user_reactions(self.reference_user, self.review)
            .await
            .expect("fetching reference reactions");
        let reference_tree = tree::assemble_comment_tree(top_level, replies, &reactions);
        let shape = |t: &[Comment]| {
            tree::flatten(t)
                .into_iter()
                .map(|c| (c.id, c.nesting_level, c.likes, c.dislikes, c.user_reaction))
                .collect::<Vec<_>>()
        };
        let app_shape = shape(&app_tree);
        assert_eq!(app_shape.len(), self.comments.len());
        let mut sorted_app = app_shape.clone();
        let mut sorted_reference = shape(&reference_tree);
        sorted_app.sort();
        sorted_reference.sort();
        assert_eq!(sorted_app, sorted_reference);
    }
}

do_tokio_test!(
    compare_with_reference,
    Vec<FuzzOp>,
    |test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new().await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
        fuzzer.check_trees().await;
    }
);
