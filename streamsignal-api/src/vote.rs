use crate::{CommentId, Reaction, ReviewId, Time, UserId};

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Vote {
    pub review_id: ReviewId,

    /// None if the vote is on the review itself
    pub comment_id: Option<CommentId>,

    pub user_id: UserId,
    pub vote_type: Reaction,
    pub created_at: Time,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewVote {
    pub review_id: ReviewId,
    pub comment_id: Option<CommentId>,
    pub vote_type: Reaction,
}

/// What a vote submission did to the user's reaction on its target
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct VoteOutcome {
    pub previous: Option<Reaction>,
    pub current: Option<Reaction>,
}

impl VoteOutcome {
    /// Voting the same kind twice takes the vote back
    pub fn toggle(previous: Option<Reaction>, requested: Reaction) -> VoteOutcome {
        let current = match previous {
            Some(p) if p == requested => None,
            _ => Some(requested),
        };
        VoteOutcome { previous, current }
    }
}
