//! AWS resource kinds and their deletion order.
//!
//! Resources must be removed in dependency order, otherwise AWS rejects the
//! call (a VPC cannot be deleted while subnets, gateways or non-main route
//! tables still reference it).

use snafu::prelude::*;

/// Returned when a document or command line names an unknown resource tag.
#[derive(Debug, Snafu)]
#[snafu(display(
    "Unknown resource type '{tag}', expected one of: {}",
    ResourceKind::DELETION_ORDER
        .iter()
        .map(|kind| kind.tag())
        .collect::<Vec<_>>()
        .join(", ")
))]
pub struct UnknownKind {
    pub tag: String,
}

/// Types of AWS resources that can be torn down.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum ResourceKind {
    /// RDS database instance.
    #[serde(rename = "rds")]
    DbInstance,
    /// Application or network load balancer.
    #[serde(rename = "elbv2")]
    LoadBalancerV2,
    /// Classic load balancer.
    #[serde(rename = "elb")]
    ClassicLoadBalancer,
    /// EC2 instance.
    #[serde(rename = "ec2")]
    Instance,
    /// NAT gateway.
    #[serde(rename = "nat")]
    NatGateway,
    /// Non-main route table.
    #[serde(rename = "rt")]
    RouteTable,
    /// Non-default security group.
    #[serde(rename = "sg")]
    SecurityGroup,
    /// VPC subnet.
    #[serde(rename = "subnet")]
    Subnet,
    /// Internet gateway.
    #[serde(rename = "igw")]
    InternetGateway,
    /// Non-default VPC.
    #[serde(rename = "vpc")]
    Vpc,
    /// AMI, along with its EBS snapshots.
    #[serde(rename = "ami")]
    Image,
    /// S3 bucket. Not scoped to a region.
    #[serde(rename = "s3")]
    Bucket,
}

impl ResourceKind {
    /// The order in which kinds are deleted, first to last.
    ///
    /// Each kind may be referenced by kinds that come before it. Buckets have
    /// no network dependencies and always go last.
    pub const DELETION_ORDER: [ResourceKind; 12] = [
        ResourceKind::DbInstance,
        ResourceKind::LoadBalancerV2,
        ResourceKind::ClassicLoadBalancer,
        ResourceKind::Instance,
        ResourceKind::NatGateway,
        ResourceKind::RouteTable,
        ResourceKind::SecurityGroup,
        ResourceKind::Subnet,
        ResourceKind::InternetGateway,
        ResourceKind::Vpc,
        ResourceKind::Image,
        ResourceKind::Bucket,
    ];

    /// The short tag used in resource documents and on the command line.
    pub fn tag(self) -> &'static str {
        match self {
            ResourceKind::DbInstance => "rds",
            ResourceKind::LoadBalancerV2 => "elbv2",
            ResourceKind::ClassicLoadBalancer => "elb",
            ResourceKind::Instance => "ec2",
            ResourceKind::NatGateway => "nat",
            ResourceKind::RouteTable => "rt",
            ResourceKind::SecurityGroup => "sg",
            ResourceKind::Subnet => "subnet",
            ResourceKind::InternetGateway => "igw",
            ResourceKind::Vpc => "vpc",
            ResourceKind::Image => "ami",
            ResourceKind::Bucket => "s3",
        }
    }

    /// Position in [`ResourceKind::DELETION_ORDER`] (lower is deleted first).
    pub fn deletion_priority(self) -> usize {
        // The enum is declared in deletion order.
        self as usize
    }

    /// Whether resources of this kind live outside any region.
    pub fn is_global(self) -> bool {
        matches!(self, ResourceKind::Bucket)
    }
}

impl core::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResourceKind::DbInstance => "RDS instances",
            ResourceKind::LoadBalancerV2 => "Application/Network load balancers",
            ResourceKind::ClassicLoadBalancer => "Classic load balancers",
            ResourceKind::Instance => "EC2 instances",
            ResourceKind::NatGateway => "NAT gateways",
            ResourceKind::RouteTable => "Route tables",
            ResourceKind::SecurityGroup => "Security groups",
            ResourceKind::Subnet => "Subnets",
            ResourceKind::InternetGateway => "Internet gateways",
            ResourceKind::Vpc => "VPCs",
            ResourceKind::Image => "AMIs",
            ResourceKind::Bucket => "S3 buckets",
        })
    }
}

impl core::str::FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::DELETION_ORDER
            .into_iter()
            .find(|kind| kind.tag() == s)
            .context(UnknownKindSnafu { tag: s })
    }
}
