use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::{
    api::{Comment, CommentId, Reaction, UserReactions},
    normalize_rows,
};

/// Builds the reply tree of a review from raw backend rows
///
/// `top_level` and `replies` are expected to be arrays of comment rows, and
/// `user_reactions` a `"comment_{id}"` to reaction map. Malformed inputs are
/// read as empty.
pub fn build_comment_tree(top_level: &Value, replies: &Value, user_reactions: &Value) -> Vec<Comment> {
    assemble_comment_tree(
        normalize_rows(top_level),
        normalize_rows(replies),
        &UserReactions::from_value(user_reactions),
    )
}

/// Builds the reply tree of a review from already-normalized comments
///
/// Returns the top-level comments in input order. Replies whose parent is
/// not in the input are dropped from the result, along with their own
/// replies.
pub fn assemble_comment_tree(
    top_level: Vec<Comment>,
    replies: Vec<Comment>,
    reactions: &UserReactions,
) -> Vec<Comment> {
    let mut table = HashMap::with_capacity(top_level.len() + replies.len());
    let mut roots = Vec::with_capacity(top_level.len());
    let mut linked = Vec::with_capacity(replies.len());
    for c in top_level {
        if table.contains_key(&c.id) {
            tracing::debug!(id = ?c.id, "ignoring duplicate top-level comment");
            continue;
        }
        roots.push(c.id);
        table.insert(c.id, c);
    }
    for c in replies {
        if table.contains_key(&c.id) {
            tracing::debug!(id = ?c.id, "ignoring duplicate reply");
            continue;
        }
        linked.push(c.id);
        table.insert(c.id, c);
    }

    let mut children: HashMap<CommentId, Vec<CommentId>> = HashMap::new();
    for id in linked {
        let parent = match table.get(&id).and_then(|c| c.parent_comment_id) {
            Some(p) => p,
            None => {
                tracing::warn!(?id, "reply has no parent comment id, dropping it");
                continue;
            }
        };
        if !table.contains_key(&parent) {
            tracing::warn!(?id, ?parent, "orphaned reply, its parent is unknown");
            continue;
        }
        let siblings = children.entry(parent).or_default();
        if !siblings.contains(&id) {
            siblings.push(id);
        }
    }

    // pre-order walk from the roots, each comment placed at most once
    let mut placed = HashSet::with_capacity(table.len());
    let mut order = Vec::with_capacity(table.len());
    let mut stack = roots.iter().rev().map(|id| (*id, 1)).collect::<Vec<_>>();
    while let Some((id, level)) = stack.pop() {
        if !placed.insert(id) {
            tracing::warn!(?id, "comment reached twice while building tree");
            continue;
        }
        order.push((id, level));
        if let Some(kids) = children.get(&id) {
            stack.extend(kids.iter().rev().map(|k| (*k, level + 1)));
        }
    }

    // build bottom-up, so that every reply is complete before its parent
    let mut built: HashMap<CommentId, Comment> = HashMap::with_capacity(order.len());
    for (id, level) in order.into_iter().rev() {
        let mut c = match table.remove(&id) {
            Some(c) => c,
            None => continue,
        };
        c.nesting_level = level;
        c.user_reaction = reactions.get(&id).or(c.user_reaction);
        c.replies = children
            .get(&id)
            .map(|kids| kids.iter().filter_map(|k| built.remove(k)).collect())
            .unwrap_or_default();
        sort_replies(&mut c.replies);
        built.insert(id, c);
    }
    roots.into_iter().filter_map(|id| built.remove(&id)).collect()
}

/// Stable sort by creation time, unparseable timestamps first
fn sort_replies(replies: &mut [Comment]) {
    replies.sort_by_key(|c| c.created_time());
}

fn set_level(c: &mut Comment, level: u32) {
    let mut stack = vec![(c, level)];
    while let Some((c, level)) = stack.pop() {
        c.nesting_level = level;
        stack.extend(c.replies.iter_mut().map(|r| (r, level + 1)));
    }
}

/// Rebuilds `tree` with the first comment with id `id` passed through `f`
///
/// `f` returning None removes the comment. Returns None if there is no such
/// comment.
fn rewrite_first<F>(tree: &[Comment], id: &CommentId, f: &mut F) -> Option<Vec<Comment>>
where
    F: FnMut(&Comment) -> Option<Comment>,
{
    for (i, c) in tree.iter().enumerate() {
        let replacement = if c.id == *id {
            Some(f(c))
        } else {
            rewrite_first(&c.replies, id, &mut *f).map(|replies| {
                Some(Comment {
                    id: c.id,
                    parent_comment_id: c.parent_comment_id,
                    review_id: c.review_id,
                    user_id: c.user_id,
                    author_name: c.author_name.clone(),
                    author_avatar: c.author_avatar.clone(),
                    content: c.content.clone(),
                    likes: c.likes,
                    dislikes: c.dislikes,
                    created_at: c.created_at.clone(),
                    nesting_level: c.nesting_level,
                    replies,
                    user_reaction: c.user_reaction,
                })
            })
        };
        if let Some(replacement) = replacement {
            let mut res = Vec::with_capacity(tree.len());
            res.extend_from_slice(&tree[..i]);
            res.extend(replacement);
            res.extend_from_slice(&tree[i + 1..]);
            return Some(res);
        }
    }
    None
}

/// Appends `reply` under the comment `parent`, wherever it is in the tree
///
/// Returns the tree unchanged if there is no such parent, or if it already
/// has a reply with the same id.
pub fn add_reply(tree: &[Comment], parent: &CommentId, reply: Comment) -> Vec<Comment> {
    let mut reply = Some(reply);
    rewrite_first(tree, parent, &mut |p| {
        let mut p = p.clone();
        if let Some(mut reply) = reply.take() {
            if p.replies.iter().all(|r| r.id != reply.id) {
                set_level(&mut reply, p.nesting_level + 1);
                p.replies.push(reply);
            }
        }
        Some(p)
    })
    .unwrap_or_else(|| tree.to_vec())
}

/// Replaces comment `id` with `replacement`, keeping its place and depth
pub fn replace_comment(tree: &[Comment], id: &CommentId, replacement: Comment) -> Vec<Comment> {
    let mut replacement = Some(replacement);
    rewrite_first(tree, id, &mut |old| {
        let mut new = replacement.take()?;
        set_level(&mut new, old.nesting_level);
        Some(new)
    })
    .unwrap_or_else(|| tree.to_vec())
}

/// Removes comment `id` and all of its replies
pub fn remove_comment(tree: &[Comment], id: &CommentId) -> Vec<Comment> {
    rewrite_first(tree, id, &mut |_| None).unwrap_or_else(|| tree.to_vec())
}

/// Moves the current user's reaction on comment `id` from `previous` to `new`
pub fn update_comment_reaction(
    tree: &[Comment],
    id: &CommentId,
    previous: Option<Reaction>,
    new: Option<Reaction>,
) -> Vec<Comment> {
    rewrite_first(tree, id, &mut |c| {
        let mut c = c.clone();
        if previous != new {
            move_vote(&mut c.likes, &mut c.dislikes, previous, new);
        }
        c.user_reaction = new;
        Some(c)
    })
    .unwrap_or_else(|| tree.to_vec())
}

/// Moves one vote from `previous` to `new` on a pair of counters
pub fn move_vote(
    likes: &mut u64,
    dislikes: &mut u64,
    previous: Option<Reaction>,
    new: Option<Reaction>,
) {
    match previous {
        Some(Reaction::Like) => *likes = likes.saturating_sub(1),
        Some(Reaction::Dislike) => *dislikes = dislikes.saturating_sub(1),
        None => (),
    }
    match new {
        Some(Reaction::Like) => *likes += 1,
        Some(Reaction::Dislike) => *dislikes += 1,
        None => (),
    }
}

pub fn find_comment<'a>(tree: &'a [Comment], id: &CommentId) -> Option<&'a Comment> {
    for c in tree {
        if c.id == *id {
            return Some(c);
        }
        if let Some(res) = find_comment(&c.replies, id) {
            return Some(res);
        }
    }
    None
}

/// All the comments of the tree, in pre-order
pub fn flatten(tree: &[Comment]) -> Vec<&Comment> {
    let mut res = Vec::new();
    let mut stack = tree.iter().rev().collect::<Vec<_>>();
    while let Some(c) = stack.pop() {
        res.push(c);
        stack.extend(c.replies.iter().rev());
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ReviewId, Uuid, MAX_NESTING_LEVEL};
    use serde_json::json;

    fn cid(n: u128) -> CommentId {
        CommentId(Uuid::from_u128(n))
    }

    fn comment(n: u128, parent: Option<u128>, created_at: &str) -> Comment {
        Comment {
            id: cid(n),
            parent_comment_id: parent.map(cid),
            review_id: ReviewId::stub(),
            user_id: None,
            author_name: String::from("Anonymous"),
            author_avatar: String::new(),
            content: format!("comment {n}"),
            likes: 0,
            dislikes: 0,
            created_at: String::from(created_at),
            nesting_level: 1,
            replies: Vec::new(),
            user_reaction: None,
        }
    }

    fn row(n: u128, parent: Option<u128>, created_at: &str) -> Value {
        json!({
            "id": cid(n).0.to_string(),
            "parent_comment_id": parent.map(|p| cid(p).0.to_string()),
            "review_id": ReviewId::stub().0.to_string(),
            "content": format!("comment {n}"),
            "created_at": created_at,
        })
    }

    fn ids(tree: &[Comment]) -> Vec<CommentId> {
        flatten(tree).into_iter().map(|c| c.id).collect()
    }

    fn check_levels(tree: &[Comment], level: u32) {
        for c in tree {
            assert_eq!(c.nesting_level, level, "bad nesting level for {:?}", c.id);
            check_levels(&c.replies, level + 1);
        }
    }

    #[test]
    fn nested_replies() {
        let tree = build_comment_tree(
            &json!([row(1, None, "2024-01-01T00:00:00Z")]),
            &json!([
                row(2, Some(1), "2024-01-01T00:01:00Z"),
                row(3, Some(2), "2024-01-01T00:02:00Z"),
            ]),
            &json!({}),
        );
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, cid(1));
        assert_eq!(tree[0].nesting_level, 1);
        assert_eq!(tree[0].replies.len(), 1);
        let two = &tree[0].replies[0];
        assert_eq!((two.id, two.nesting_level), (cid(2), 2));
        assert_eq!(two.replies.len(), 1);
        let three = &two.replies[0];
        assert_eq!((three.id, three.nesting_level), (cid(3), 3));
        assert!(three.replies.is_empty());
    }

    #[test]
    fn replies_listed_before_their_parent() {
        let tree = build_comment_tree(
            &json!([row(1, None, "")]),
            &json!([row(3, Some(2), ""), row(2, Some(1), "")]),
            &json!(null),
        );
        assert_eq!(ids(&tree), vec![cid(1), cid(2), cid(3)]);
        check_levels(&tree, 1);
    }

    #[test]
    fn orphaned_reply_is_excluded() {
        let tree = build_comment_tree(
            &json!([row(1, None, "")]),
            &json!([row(2, Some(1), ""), row(3, Some(42), ""), row(4, Some(3), "")]),
            &json!({}),
        );
        assert_eq!(ids(&tree), vec![cid(1), cid(2)]);
    }

    #[test]
    fn empty_and_malformed_inputs() {
        assert!(build_comment_tree(&json!([]), &json!([]), &json!({})).is_empty());
        assert!(build_comment_tree(&json!(null), &json!("x"), &json!(3)).is_empty());
        let tree = build_comment_tree(&json!([row(1, None, "")]), &json!({}), &json!([1]));
        assert_eq!(ids(&tree), vec![cid(1)]);
    }

    #[test]
    fn top_level_order_is_kept_and_replies_are_sorted() {
        let tree = build_comment_tree(
            &json!([row(2, None, "2024-01-02T00:00:00Z"), row(1, None, "2024-01-01T00:00:00Z")]),
            &json!([
                row(5, Some(2), "2024-01-05T00:00:00Z"),
                row(3, Some(2), "2024-01-03T00:00:00Z"),
                row(4, Some(2), "2024-01-04T00:00:00+05:00"),
            ]),
            &json!({}),
        );
        assert_eq!(tree[0].id, cid(2));
        assert_eq!(tree[1].id, cid(1));
        let replies = tree[0].replies.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(replies, vec![cid(3), cid(4), cid(5)]);
    }

    #[test]
    fn unparseable_timestamps_do_not_break_sorting() {
        let tree = build_comment_tree(
            &json!([row(1, None, "")]),
            &json!([
                row(3, Some(1), "2024-01-03T00:00:00Z"),
                row(2, Some(1), "not a date"),
                row(4, Some(1), "2024-01-01T00:00:00Z"),
            ]),
            &json!({}),
        );
        let replies = tree[0].replies.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(replies, vec![cid(2), cid(4), cid(3)]);
    }

    #[test]
    fn duplicates_keep_the_first_record() {
        let mut dup = row(2, Some(1), "");
        dup["content"] = json!("second copy");
        let tree = build_comment_tree(
            &json!([row(1, None, ""), row(1, None, "")]),
            &json!([row(2, Some(1), ""), dup, row(1, Some(2), "")]),
            &json!({}),
        );
        assert_eq!(ids(&tree), vec![cid(1), cid(2)]);
        assert_eq!(tree[0].replies[0].content, "comment 2");
    }

    #[test]
    fn cycles_are_unreachable() {
        let tree = build_comment_tree(
            &json!([row(1, None, "")]),
            &json!([row(2, Some(3), ""), row(3, Some(2), "")]),
            &json!({}),
        );
        assert_eq!(ids(&tree), vec![cid(1)]);
    }

    #[test]
    fn user_reactions_are_attached() {
        let tree = build_comment_tree(
            &json!([row(1, None, "")]),
            &json!([row(2, Some(1), "")]),
            &json!({ (UserReactions::key(&cid(2))): "dislike" }),
        );
        assert_eq!(tree[0].user_reaction, None);
        assert_eq!(tree[0].replies[0].user_reaction, Some(Reaction::Dislike));
    }

    /// Comment 1 and `len - 1` replies, each answering the previous one
    fn chain(len: u128) -> (Vec<Comment>, Vec<Comment>) {
        let replies = (2..=len).map(|n| comment(n, Some(n - 1), "")).collect();
        (vec![comment(1, None, "")], replies)
    }

    #[test]
    fn long_reply_chains() {
        // same stack size as a tokio worker thread
        let levels = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let (top, replies) = chain(5000);
                let tree = assemble_comment_tree(top, replies, &UserReactions::default());
                let levels = flatten(&tree)
                    .into_iter()
                    .map(|c| c.nesting_level)
                    .collect::<Vec<_>>();
                let mut rest = tree;
                while let Some(mut c) = rest.pop() {
                    rest.append(&mut c.replies);
                }
                levels
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(levels, (1..=5000).collect::<Vec<u32>>());
    }

    #[test]
    fn deepest_allowed_tree_reads_back() {
        let (top, replies) = chain(u128::from(MAX_NESTING_LEVEL));
        let tree = assemble_comment_tree(top, replies, &UserReactions::default());
        let deepest = flatten(&tree).last().map(|c| c.nesting_level);
        assert_eq!(deepest, Some(MAX_NESTING_LEVEL));
        let json = serde_json::to_string(&tree).unwrap();
        let back: Vec<Comment> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
    }

    fn sample_tree() -> Vec<Comment> {
        assemble_comment_tree(
            vec![comment(1, None, "1"), comment(10, None, "1")],
            vec![
                comment(2, Some(1), "2024-01-01T00:00:00Z"),
                comment(3, Some(2), "2024-01-01T00:00:00Z"),
                comment(4, Some(1), "2024-01-02T00:00:00Z"),
            ],
            &UserReactions::default(),
        )
    }

    #[test]
    fn add_reply_at_depth() {
        let tree = sample_tree();
        let res = add_reply(&tree, &cid(3), comment(5, Some(3), ""));
        let five = find_comment(&res, &cid(5)).unwrap();
        assert_eq!(five.nesting_level, 4);
        assert_eq!(ids(&res), vec![cid(1), cid(2), cid(3), cid(5), cid(4), cid(10)]);
        // the original is untouched
        assert!(find_comment(&tree, &cid(5)).is_none());
    }

    #[test]
    fn add_reply_to_unknown_parent_or_twice() {
        let tree = sample_tree();
        assert_eq!(add_reply(&tree, &cid(99), comment(5, Some(99), "")), tree);
        let once = add_reply(&tree, &cid(1), comment(5, Some(1), ""));
        let twice = add_reply(&once, &cid(1), comment(5, Some(1), ""));
        assert_eq!(once, twice);
    }

    #[test]
    fn replace_keeps_position() {
        let tree = sample_tree();
        let mut new = comment(2, Some(1), "2024-01-01T00:00:00Z");
        new.content = String::from("edited");
        let res = replace_comment(&tree, &cid(2), new);
        assert_eq!(res[0].replies[0].content, "edited");
        assert_eq!(res[0].replies[0].nesting_level, 2);
        assert!(res[0].replies[0].replies.is_empty());
        assert_eq!(res[0].replies[1].id, cid(4));
        assert_eq!(replace_comment(&tree, &cid(99), comment(99, None, "")), tree);
    }

    #[test]
    fn remove_subtree() {
        let tree = sample_tree();
        let res = remove_comment(&tree, &cid(2));
        assert_eq!(ids(&res), vec![cid(1), cid(4), cid(10)]);
        assert_eq!(remove_comment(&tree, &cid(99)), tree);
        assert_eq!(ids(&remove_comment(&tree, &cid(10))), vec![cid(1), cid(2), cid(3), cid(4)]);
    }

    #[test]
    fn reaction_counters() {
        use Reaction::*;
        let tree = sample_tree();
        let res = update_comment_reaction(&tree, &cid(3), None, Some(Like));
        let c = find_comment(&res, &cid(3)).unwrap();
        assert_eq!((c.likes, c.dislikes, c.user_reaction), (1, 0, Some(Like)));

        let res = update_comment_reaction(&res, &cid(3), Some(Like), Some(Dislike));
        let c = find_comment(&res, &cid(3)).unwrap();
        assert_eq!((c.likes, c.dislikes, c.user_reaction), (0, 1, Some(Dislike)));

        let res = update_comment_reaction(&res, &cid(3), Some(Dislike), None);
        let c = find_comment(&res, &cid(3)).unwrap();
        assert_eq!((c.likes, c.dislikes, c.user_reaction), (0, 0, None));

        // counters never go below zero
        let res = update_comment_reaction(&res, &cid(3), Some(Like), None);
        let c = find_comment(&res, &cid(3)).unwrap();
        assert_eq!((c.likes, c.dislikes), (0, 0));
    }

    fn time(secs: Option<u16>) -> String {
        use chrono::TimeZone;
        match secs {
            Some(s) => chrono::Utc
                .timestamp_opt(i64::from(s), 0)
                .unwrap()
                .to_rfc3339(),
            None => String::from("garbage"),
        }
    }

    /// Turns generated (id, parent, time) triples into (top-level, replies)
    fn generated(rows: &[(u8, Option<u8>, Option<u16>)]) -> (Vec<Comment>, Vec<Comment>) {
        let mut top = Vec::new();
        let mut replies = Vec::new();
        for (id, parent, secs) in rows {
            let c = comment(u128::from(*id), parent.map(u128::from), &time(*secs));
            match parent {
                None => top.push(c),
                Some(_) => replies.push(c),
            }
        }
        (top, replies)
    }

    fn expected_ids(top: &[Comment], replies: &[Comment]) -> HashSet<CommentId> {
        let mut parent_of = HashMap::new();
        let mut roots = HashSet::new();
        for c in top {
            if !parent_of.contains_key(&c.id) && !roots.contains(&c.id) {
                roots.insert(c.id);
            }
        }
        for c in replies {
            if !roots.contains(&c.id) && !parent_of.contains_key(&c.id) {
                parent_of.insert(c.id, c.parent_comment_id);
            }
        }
        let mut reachable = roots.clone();
        loop {
            let before = reachable.len();
            for (id, parent) in parent_of.iter() {
                if parent.map(|p| reachable.contains(&p)).unwrap_or(false) {
                    reachable.insert(*id);
                }
            }
            if reachable.len() == before {
                return reachable;
            }
        }
    }

    fn check_sorted(tree: &[Comment]) {
        for c in tree {
            let times = c
                .replies
                .iter()
                .filter_map(|r| r.created_time())
                .collect::<Vec<_>>();
            assert!(times.windows(2).all(|w| w[0] <= w[1]), "unsorted replies");
            check_sorted(&c.replies);
        }
    }

    #[test]
    fn fuzz_tree_invariants() {
        bolero::check!()
            .with_type::<Vec<(u8, Option<u8>, Option<u16>)>>()
            .cloned()
            .for_each(|rows| {
                let (top, replies) = generated(&rows);
                let expected = expected_ids(&top, &replies);
                let tree = assemble_comment_tree(top, replies, &UserReactions::default());
                let got = ids(&tree);
                let got_set = got.iter().copied().collect::<HashSet<_>>();
                assert_eq!(got.len(), got_set.len(), "duplicate node in tree");
                assert_eq!(got_set, expected);
                check_levels(&tree, 1);
                check_sorted(&tree);
            })
    }

    #[test]
    fn fuzz_insert_then_remove() {
        bolero::check!()
            .with_type::<(Vec<(u8, Option<u8>, Option<u16>)>, u8)>()
            .cloned()
            .for_each(|(rows, pick)| {
                let (top, replies) = generated(&rows);
                let tree = assemble_comment_tree(top, replies, &UserReactions::default());
                let all = ids(&tree);
                if all.is_empty() {
                    return;
                }
                let parent = all[usize::from(pick) % all.len()];
                let fresh = comment(1000, Some(parent.0.as_u128()), "");
                let inserted = add_reply(&tree, &parent, fresh);
                assert!(find_comment(&inserted, &cid(1000)).is_some());
                check_levels(&inserted, 1);
                assert_eq!(remove_comment(&inserted, &cid(1000)), tree);
            })
    }

    #[test]
    fn fuzz_reaction_idempotence() {
        bolero::check!()
            .with_type::<(Vec<(u8, Option<u8>, Option<u16>)>, u8, Option<bool>)>()
            .cloned()
            .for_each(|(rows, pick, new)| {
                let (top, replies) = generated(&rows);
                let tree = assemble_comment_tree(top, replies, &UserReactions::default());
                let all = ids(&tree);
                if all.is_empty() {
                    return;
                }
                let target = all[usize::from(pick) % all.len()];
                let new = new.map(|like| if like { Reaction::Like } else { Reaction::Dislike });
                let previous = find_comment(&tree, &target).and_then(|c| c.user_reaction);
                let once = update_comment_reaction(&tree, &target, previous, new);
                let current = find_comment(&once, &target).and_then(|c| c.user_reaction);
                assert_eq!(current, new);
                let twice = update_comment_reaction(&once, &target, current, new);
                assert_eq!(once, twice);
            })
    }
}
