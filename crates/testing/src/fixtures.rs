//! Test fixtures for generating members and teams with realistic data.

use datajpa_domain::{Member, Team};
use fake::{
    faker::{company::en::CompanyName, internet::en::Username},
    Fake,
};

/// Create an unsaved team with a random name
pub fn create_test_team() -> Team {
    Team::new(CompanyName().fake::<String>())
}

/// Create an unsaved member with a random username and age, without a team
pub fn create_test_member() -> Member {
    Member::with_age(Username().fake::<String>(), (1..90).fake::<i64>())
}

/// Create an unsaved member of an already saved team
pub fn create_test_member_of(team: &Team) -> Member {
    let mut member = create_test_member();
    member.change_team(team);
    member
}

/// Members named `member1`, `member2`, ... with the given ages
pub fn create_members_with_ages(ages: &[i64]) -> Vec<Member> {
    ages.iter()
        .enumerate()
        .map(|(i, &age)| Member::with_age(format!("member{}", i + 1), age))
        .collect()
}

/// Create multiple random members
pub fn create_test_members(count: usize) -> Vec<Member> {
    (0..count).map(|_| create_test_member()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_member_fixture() {
        let member = create_test_member();
        assert!(member.id.is_none());
        assert!(!member.username.is_empty());
        assert!((1..90).contains(&member.age));
        assert!(member.team_id.is_none());
    }

    #[test]
    fn test_members_with_ages() {
        let members = create_members_with_ages(&[10, 19, 20]);
        assert_eq!(members.len(), 3);
        assert_eq!(members[1].username, "member2");
        assert_eq!(members[2].age, 20);
    }

    #[test]
    fn test_create_multiple_members() {
        assert_eq!(create_test_members(5).len(), 5);
    }
}
