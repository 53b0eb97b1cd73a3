use anyhow::{anyhow, Context};
use streamsignal_api::{
    ActionResult, AuthToken, Comment, CommentId, Error, NewComment, NewVote, Reaction, ReviewId,
    Service, UserReactions, Uuid, VoteOutcome,
};
use streamsignal_client::tree;

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long)]
    host: String,

    /// Session token, required by the commands that post
    #[structopt(long, env = "STREAMSIGNAL_TOKEN", hide_env_values = true)]
    token: Option<Uuid>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// List the streaming services
    Services,

    /// Print the comment tree of a review
    Thread { review: Uuid },

    /// Comment on a review
    Comment {
        review: Uuid,

        text: String,

        /// Comment to reply to
        #[structopt(long)]
        parent: Option<Uuid>,
    },

    /// Like or dislike a review or one of its comments, or take the reaction
    /// back if it was already there
    React {
        review: Uuid,

        #[structopt(parse(try_from_str = parse_reaction))]
        reaction: Reaction,

        /// Comment to react to, instead of the review itself
        #[structopt(long)]
        comment: Option<Uuid>,
    },
}

fn parse_reaction(s: &str) -> anyhow::Result<Reaction> {
    Reaction::parse(s).ok_or_else(|| anyhow!("reaction must be like or dislike, not {s:?}"))
}

fn require_token(token: Option<Uuid>) -> anyhow::Result<AuthToken> {
    token
        .map(AuthToken)
        .ok_or_else(|| anyhow!("STREAMSIGNAL_TOKEN must be set for this command"))
}

async fn parse_response<T>(resp: reqwest::Response) -> anyhow::Result<T>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = resp.status();
    let body = resp.bytes().await.context("reading response body")?;
    if !status.is_success() {
        let err: Error = Error::parse(&body)
            .with_context(|| format!("parsing error response with status {status}"))?;
        return Err(err.into());
    }
    serde_json::from_slice(&body).context("parsing response body")
}

fn print_tree(tree: &[Comment]) {
    for c in tree::flatten(tree) {
        let indent = "  ".repeat(c.nesting_level.saturating_sub(1) as usize);
        let mine = match c.user_reaction {
            Some(r) => format!(" (you: {})", r.as_str()),
            None => String::new(),
        };
        println!(
            "{indent}{} [+{} -{}]{mine} {}: {}",
            c.id, c.likes, c.dislikes, c.author_name, c.content
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let Opt { host, token, cmd } = <Opt as structopt::StructOpt>::from_args();

    let client = reqwest::Client::new();

    match cmd {
        Command::Services => {
            let resp = client
                .get(format!("{host}/api/services"))
                .send()
                .await?;
            let services: Vec<Service> = parse_response(resp).await?;
            for s in services {
                println!("{}\t{}\t{}", s.slug, s.id.0, s.name);
            }
        }
        Command::Thread { review } => {
            let mut req = client.get(format!("{host}/api/reviews/{review}/comments"));
            if let Some(tok) = token {
                req = req.bearer_auth(tok);
            }
            let comments: Vec<Comment> = parse_response(req.send().await?).await?;
            if let Some(tok) = token {
                let resp = client
                    .get(format!("{host}/api/reviews/{review}/reactions"))
                    .bearer_auth(tok)
                    .send()
                    .await?;
                let reactions: UserReactions = parse_response(resp).await?;
                if let Some(r) = reactions.review {
                    println!("(you: {}) on the review", r.as_str());
                }
            }
            print_tree(&comments);
        }
        Command::Comment {
            review,
            text,
            parent,
        } => {
            let new = NewComment {
                id: CommentId(Uuid::new_v4()),
                review_id: ReviewId(review),
                parent_comment_id: parent.map(CommentId),
                content: text,
            };
            new.validate()?;
            tracing::debug!(id = ?new.id, "submitting comment");
            let resp = client
                .post(format!("{host}/api/comments"))
                .json(&new)
                .bearer_auth(require_token(token)?.0)
                .send()
                .await?;
            let res: ActionResult<Comment> = parse_response(resp).await?;
            let stored = res.into_result()?;
            println!("{}", stored.id);
        }
        Command::React {
            review,
            reaction,
            comment,
        } => {
            let vote = NewVote {
                review_id: ReviewId(review),
                comment_id: comment.map(CommentId),
                vote_type: reaction,
            };
            let resp = client
                .post(format!("{host}/api/votes"))
                .json(&vote)
                .bearer_auth(require_token(token)?.0)
                .send()
                .await?;
            let res: ActionResult<VoteOutcome> = parse_response(resp).await?;
            match res.into_result()?.current {
                Some(r) => println!("{}", r.as_str()),
                None => println!("removed"),
            }
        }
    }

    Ok(())
}
