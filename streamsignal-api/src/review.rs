use crate::{Error, ReviewId, ServiceId, Time, UserId};

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Service {
    pub id: ServiceId,
    pub slug: String,
    pub name: String,
    pub description: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Ratings {
    pub overall: u8,
    pub content: u8,
    pub value: u8,
    pub usability: u8,
    pub streaming_quality: u8,
}

impl Ratings {
    pub fn validate(&self) -> Result<(), Error> {
        for r in [
            self.overall,
            self.content,
            self.value,
            self.usability,
            self.streaming_quality,
        ] {
            if !(1..=5).contains(&r) {
                return Err(Error::InvalidRating(r));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Review {
    pub id: ReviewId,
    pub service_id: ServiceId,
    pub user_id: UserId,
    pub author_name: String,
    pub ratings: Ratings,
    pub content: String,
    pub likes: u64,
    pub dislikes: u64,
    pub created_at: Time,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewReview {
    pub id: ReviewId,
    pub service_id: ServiceId,
    pub ratings: Ratings,
    pub content: String,
}

impl NewReview {
    pub fn validate(&self) -> Result<(), Error> {
        self.ratings.validate()?;
        crate::validate_content(&self.content)
    }
}
